use serde::{Deserialize, Serialize};

use crate::error::{Result, TombolaError};

/// An order as stored in the `orders` table.
///
/// `(name, date)` identifies the purchase; `id` is only a surrogate key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub id: i64,
    pub date: String,
    pub firm: Option<String>,
    pub name: String,
    pub email: String,
    pub num_tickets: i64,
    pub achat: Option<String>,
    pub notified_at: Option<String>,
}

impl Order {
    pub fn key(&self) -> OrderKey {
        OrderKey {
            name: self.name.clone(),
            date: self.date.clone(),
        }
    }

    pub fn is_notified(&self) -> bool {
        self.notified_at.is_some()
    }
}

/// An order before it reaches the store: what the spreadsheet reader yields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub date: String,
    pub firm: Option<String>,
    pub name: String,
    pub email: String,
    pub num_tickets: i64,
    pub achat: Option<String>,
}

impl NewOrder {
    pub fn new(name: &str, date: &str, email: &str, num_tickets: i64) -> Self {
        NewOrder {
            date: date.to_string(),
            firm: None,
            name: name.to_string(),
            email: email.to_string(),
            num_tickets,
            achat: None,
        }
    }

    pub fn with_firm(mut self, firm: &str) -> Self {
        self.firm = Some(firm.to_string());
        self
    }

    pub fn with_achat(mut self, achat: &str) -> Self {
        self.achat = Some(achat.to_string());
        self
    }

    /// Trim text fields, turn blank optionals into `None`, then check the
    /// fields the store relies on.
    pub fn normalized(self) -> Result<NewOrder> {
        let order = NewOrder {
            date: self.date.trim().to_string(),
            firm: non_blank(self.firm),
            name: self.name.trim().to_string(),
            email: self.email.trim().to_string(),
            num_tickets: self.num_tickets,
            achat: non_blank(self.achat),
        };
        order.validate()?;
        Ok(order)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TombolaError::validation("name is required"));
        }
        if self.date.trim().is_empty() {
            return Err(TombolaError::validation(format!(
                "date is required (order of {})",
                self.name
            )));
        }
        validate_quantity(self.num_tickets)
    }

    pub fn key(&self) -> OrderKey {
        OrderKey {
            name: self.name.clone(),
            date: self.date.clone(),
        }
    }
}

/// The natural key of an order, as posted back by the orders page forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderKey {
    pub name: String,
    pub date: String,
}

pub fn validate_quantity(num_tickets: i64) -> Result<()> {
    if num_tickets < 1 {
        return Err(TombolaError::validation(format!(
            "ticket quantity must be a positive integer, got {}",
            num_tickets
        )));
    }
    Ok(())
}

pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
