use chrono::NaiveDateTime;
use rust_xlsxwriter::{Format, Workbook};

use crate::error::{Result, TombolaError};
use crate::loader::DATE_FORMAT;
use crate::tickets::Ticket;

/// Column titles of the printing export, one row per ticket.
pub const EXPORT_COLUMNS: [&str; 6] = ["Date", "Achat", "Ticket", "Nom", "email", "firm"];

/// Convert tickets to XLSX format
///
/// Writes a header row followed by one row per ticket, in the order the
/// tickets are given.
///
/// # Arguments
/// * `tickets` - The tickets to print, usually `tickets::expand(&orders)`
///
/// # Returns
/// * `Result<Vec<u8>>` - XLSX file content as bytes or an error
///
/// # Examples
/// ```
/// use tombola::downloader::to_xlsx;
/// use tombola::tickets::expand;
///
/// let xlsx = to_xlsx(expand(&[])).unwrap();
/// assert!(!xlsx.is_empty());
/// ```
pub fn to_xlsx<'a>(tickets: impl IntoIterator<Item = Ticket<'a>>) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Tickets")?;

    let bold = Format::new().set_bold();
    for (col, title) in EXPORT_COLUMNS.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, *title, &bold)?;
    }

    for (index, ticket) in tickets.into_iter().enumerate() {
        let row = index as u32 + 1;
        for (col, value) in ticket_row(&ticket).iter().enumerate() {
            worksheet.write_string(row, col as u16, value.as_str())?;
        }
    }

    Ok(workbook.save_to_buffer()?)
}

/// Convert tickets to CSV format
///
/// Same columns as [`to_xlsx`]; quoting is left to the `csv` writer.
///
/// # Arguments
/// * `tickets` - The tickets to print
///
/// # Returns
/// * `Result<String>` - CSV content as a string or an error
pub fn to_csv<'a>(tickets: impl IntoIterator<Item = Ticket<'a>>) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(EXPORT_COLUMNS)?;
    for ticket in tickets {
        writer.write_record(ticket_row(&ticket))?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| TombolaError::Export(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| TombolaError::Export(e.to_string()))
}

fn ticket_row(ticket: &Ticket<'_>) -> [String; 6] {
    let order = ticket.order;
    [
        print_date(&order.date),
        order.achat.clone().unwrap_or_default(),
        ticket.label(),
        order.name.clone(),
        order.email.clone(),
        order.firm.clone().unwrap_or_default(),
    ]
}

// Tickets show the day of purchase only.
fn print_date(date: &str) -> String {
    NaiveDateTime::parse_from_str(date, DATE_FORMAT)
        .map(|dt| dt.date().to_string())
        .unwrap_or_else(|_| date.to_string())
}
