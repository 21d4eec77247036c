use std::ops::RangeInclusive;
use std::sync::Arc;

use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::info;
use serde::Serialize;

use crate::config::SmtpConfig;
use crate::error::{Result, TombolaError};
use crate::order::Order;
use crate::store::OrderStore;
use crate::tickets::ticket_range;

pub const SUBJECT: &str = "Vos billets de tombola / Your raffle tickets";

/// Who actually receives ticket mail.
///
/// Outside production every message goes to the test recipient (or back to
/// the sender) so a rehearsal never reaches buyers.
#[derive(Debug, Clone)]
pub struct Recipients {
    pub sender: String,
    pub production: bool,
    pub test_recipient: Option<String>,
}

impl Recipients {
    pub fn recipient_for(&self, buyer_email: &str) -> String {
        if self.production {
            buyer_email.to_string()
        } else {
            self.test_recipient
                .clone()
                .unwrap_or_else(|| self.sender.clone())
        }
    }
}

impl From<&SmtpConfig> for Recipients {
    fn from(config: &SmtpConfig) -> Self {
        Recipients {
            sender: config.sender.clone(),
            production: config.production,
            test_recipient: config.test_recipient.clone(),
        }
    }
}

/// A composed ticket confirmation, ready to hand to a [`Notifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub first_ticket: u64,
    pub last_ticket: u64,
}

impl TicketEmail {
    pub fn for_order(order: &Order, tickets: RangeInclusive<u64>, recipients: &Recipients) -> Self {
        let (first, last) = (*tickets.start(), *tickets.end());
        let count = last - first + 1;
        let mode = if recipients.production {
            "de production"
        } else {
            "de test (redirigé)"
        };
        let body = format!(
            "Bonjour {},\n\n\
             Merci pour votre achat. Voici vos numéros de billets: {} à {}.\n\
             Nombre de billets: {}.\n\n\
             Ceci est un email {}.",
            order.name, first, last, count, mode
        );

        TicketEmail {
            from: recipients.sender.clone(),
            to: recipients.recipient_for(&order.email),
            subject: SUBJECT.to_string(),
            body,
            first_ticket: first,
            last_ticket: last,
        }
    }
}

/// Delivery of ticket confirmations. Sending may block.
pub trait Notifier: Send + Sync {
    fn send(&self, email: &TicketEmail) -> Result<()>;
}

pub struct SmtpMailer {
    smtp: SmtpTransport,
}

impl SmtpMailer {
    /// Port 465 uses implicit TLS; any other port negotiates STARTTLS.
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let builder = if config.port == 465 {
            SmtpTransport::relay(&config.host)
        } else {
            SmtpTransport::starttls_relay(&config.host)
        }
        .map_err(|e| TombolaError::Notification(e.to_string()))?;

        let smtp = builder.credentials(creds).port(config.port).build();
        Ok(SmtpMailer { smtp })
    }
}

impl Notifier for SmtpMailer {
    fn send(&self, email: &TicketEmail) -> Result<()> {
        let message = Message::builder()
            .from(email.from.parse().map_err(notification)?)
            .to(email.to.parse().map_err(notification)?)
            .subject(email.subject.clone())
            .body(email.body.clone())
            .map_err(notification)?;

        self.smtp.send(&message).map_err(notification)?;
        Ok(())
    }
}

fn notification(err: impl std::fmt::Display) -> TombolaError {
    TombolaError::Notification(err.to_string())
}

/// Email one order its ticket numbers, then mark it notified.
///
/// The numbers come from the same expansion the printing export uses. The
/// order is only marked once the mail has gone out.
pub async fn notify_order(
    store: &OrderStore,
    notifier: Arc<dyn Notifier>,
    recipients: &Recipients,
    name: &str,
    date: &str,
) -> Result<TicketEmail> {
    let orders = store.list_all().await?;
    let order = orders
        .iter()
        .find(|o| o.name == name && o.date == date)
        .ok_or_else(|| TombolaError::NotFound {
            name: name.to_string(),
            date: date.to_string(),
        })?;
    let range = ticket_range(&orders, name, date)
        .ok_or_else(|| TombolaError::validation(format!("order of {} has no tickets", name)))?;

    let email = TicketEmail::for_order(order, range, recipients);
    let outgoing = email.clone();
    tokio::task::spawn_blocking(move || notifier.send(&outgoing))
        .await
        .map_err(notification)??;

    store.mark_notified(name, date).await?;
    info!(
        "Sent tickets {}..={} of {} to {}",
        email.first_ticket, email.last_ticket, name, email.to
    );
    Ok(email)
}
