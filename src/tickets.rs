//! Expansion of orders into individually numbered tickets.
//!
//! Tickets are never stored. They are numbered from 1 in the order the store
//! lists orders, so the same table contents always print the same numbers.

use std::ops::RangeInclusive;

use serde::Serialize;

use crate::order::Order;

/// One printable ticket: a number plus the order it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ticket<'a> {
    pub ticket_id: u64,
    pub order: &'a Order,
}

impl Ticket<'_> {
    /// Printed form of the number, e.g. `TICKET_0042`.
    pub fn label(&self) -> String {
        ticket_label(self.ticket_id)
    }
}

pub fn ticket_label(ticket_id: u64) -> String {
    format!("TICKET_{:04}", ticket_id)
}

/// Lazy iterator over the tickets of a slice of orders.
pub struct Tickets<'a> {
    orders: std::slice::Iter<'a, Order>,
    current: Option<(&'a Order, u64)>,
    next_id: u64,
}

impl<'a> Iterator for Tickets<'a> {
    type Item = Ticket<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((order, remaining)) = self.current.as_mut() {
                if *remaining > 0 {
                    *remaining -= 1;
                    let ticket = Ticket {
                        ticket_id: self.next_id,
                        order: *order,
                    };
                    self.next_id += 1;
                    return Some(ticket);
                }
            }
            let order = self.orders.next()?;
            self.current = Some((order, quantity(order)));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let pending = self.current.map_or(0, |(_, remaining)| remaining)
            + self.orders.as_slice().iter().map(quantity).sum::<u64>();
        let pending = pending as usize;
        (pending, Some(pending))
    }
}

impl ExactSizeIterator for Tickets<'_> {}

/// Number every ticket of `orders`, starting at 1.
///
/// Orders with a zero quantity yield nothing and leave the numbering of the
/// following orders untouched.
pub fn expand(orders: &[Order]) -> Tickets<'_> {
    Tickets {
        orders: orders.iter(),
        current: None,
        next_id: 1,
    }
}

pub fn total_tickets(orders: &[Order]) -> u64 {
    orders.iter().map(quantity).sum()
}

/// Each order with the ticket numbers `expand` gives it, in one pass.
///
/// The range is `None` for an order without tickets.
pub fn ticket_ranges(
    orders: &[Order],
) -> impl Iterator<Item = (&Order, Option<RangeInclusive<u64>>)> + '_ {
    orders.iter().scan(1, |next_id, order| {
        let first = *next_id;
        let count = quantity(order);
        *next_id += count;
        Some((order, (count > 0).then(|| first..=first + count - 1)))
    })
}

/// The ticket numbers `expand` gives to the order identified by name and date.
///
/// `None` when the order is absent or has no tickets.
pub fn ticket_range(orders: &[Order], name: &str, date: &str) -> Option<RangeInclusive<u64>> {
    ticket_ranges(orders)
        .find(|(order, _)| order.name == name && order.date == date)
        .and_then(|(_, range)| range)
}

// Stored quantities are validated positive; anything else counts as none.
fn quantity(order: &Order) -> u64 {
    u64::try_from(order.num_tickets).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(id: i64, name: &str, date: &str, num_tickets: i64) -> Order {
        Order {
            id,
            date: date.to_string(),
            firm: None,
            name: name.to_string(),
            email: format!("{}@example.org", name.to_lowercase()),
            num_tickets,
            achat: None,
            notified_at: None,
        }
    }

    #[test]
    fn numbers_tickets_across_orders() {
        let orders = vec![
            order(1, "Alice", "2024-01-01", 2),
            order(2, "Bob", "2024-01-01", 3),
        ];
        let tickets: Vec<(u64, &str)> = expand(&orders)
            .map(|t| (t.ticket_id, t.order.name.as_str()))
            .collect();

        assert_eq!(
            tickets,
            vec![(1, "Alice"), (2, "Alice"), (3, "Bob"), (4, "Bob"), (5, "Bob")]
        );
    }

    #[test]
    fn ids_are_contiguous_and_match_total() {
        let orders = vec![
            order(1, "A", "2024-01-01", 4),
            order(2, "B", "2024-01-02", 1),
            order(3, "C", "2024-01-03", 7),
            order(4, "D", "2024-01-04", 2),
        ];
        let ids: Vec<u64> = expand(&orders).map(|t| t.ticket_id).collect();
        let total = total_tickets(&orders);

        assert_eq!(total, 14);
        assert_eq!(ids, (1..=total).collect::<Vec<_>>());
    }

    #[test]
    fn zero_quantity_orders_are_skipped() {
        let orders = vec![
            order(1, "Alice", "2024-01-01", 2),
            order(2, "Ghost", "2024-01-01", 0),
            order(3, "Bob", "2024-01-02", 1),
            order(4, "Broken", "2024-01-03", -3),
        ];
        let tickets: Vec<(u64, &str)> = expand(&orders)
            .map(|t| (t.ticket_id, t.order.name.as_str()))
            .collect();

        assert_eq!(tickets, vec![(1, "Alice"), (2, "Alice"), (3, "Bob")]);
        assert_eq!(ticket_range(&orders, "Ghost", "2024-01-01"), None);
        assert_eq!(ticket_range(&orders, "Bob", "2024-01-02"), Some(3..=3));
    }

    #[test]
    fn expansion_is_deterministic_and_sized() {
        let orders = vec![
            order(1, "Alice", "2024-01-01", 2),
            order(2, "Bob", "2024-01-01", 3),
        ];
        let first: Vec<_> = expand(&orders).collect();
        let second: Vec<_> = expand(&orders).collect();
        assert_eq!(first, second);

        let mut tickets = expand(&orders);
        assert_eq!(tickets.len(), 5);
        tickets.next();
        tickets.next();
        tickets.next();
        assert_eq!(tickets.len(), 2);
    }

    #[test]
    fn empty_store_has_no_tickets() {
        assert_eq!(expand(&[]).count(), 0);
        assert_eq!(total_tickets(&[]), 0);
    }

    #[test]
    fn range_matches_expansion() {
        let orders = vec![
            order(1, "Alice", "2024-01-01", 2),
            order(2, "Bob", "2024-01-01", 3),
        ];
        assert_eq!(ticket_range(&orders, "Alice", "2024-01-01"), Some(1..=2));
        assert_eq!(ticket_range(&orders, "Bob", "2024-01-01"), Some(3..=5));
        assert_eq!(ticket_range(&orders, "Bob", "2024-02-01"), None);
    }

    #[test]
    fn ranges_cover_expansion_in_one_pass() {
        let orders = vec![
            order(1, "Alice", "2024-01-01", 2),
            order(2, "Nobody", "2024-01-01", 0),
            order(3, "Bob", "2024-01-01", 3),
        ];

        let ranges: Vec<(String, Option<RangeInclusive<u64>>)> = ticket_ranges(&orders)
            .map(|(order, range)| (order.name.clone(), range))
            .collect();
        assert_eq!(
            ranges,
            vec![
                ("Alice".to_string(), Some(1..=2)),
                ("Nobody".to_string(), None),
                ("Bob".to_string(), Some(3..=5)),
            ]
        );

        for (order, range) in ticket_ranges(&orders) {
            let ids: Vec<u64> = expand(&orders)
                .filter(|t| t.order.id == order.id)
                .map(|t| t.ticket_id)
                .collect();
            assert_eq!(ids, range.map(|r| r.collect::<Vec<u64>>()).unwrap_or_default());
        }
    }

    #[test]
    fn labels_are_zero_padded() {
        assert_eq!(ticket_label(7), "TICKET_0007");
        assert_eq!(ticket_label(12345), "TICKET_12345");
    }
}
