use std::io::Cursor;
use std::path::Path;
use std::sync::LazyLock;

use calamine::{Data, DataType, Range, Reader, open_workbook_auto_from_rs};
use chrono::{NaiveDate, NaiveDateTime};
use log::{debug, info};
use regex::Regex;

use crate::error::ParseError;
use crate::order::NewOrder;

/// Storage format of order dates; lexical order is chronological order.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TEXT_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

const TEXT_DAY_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y"];

static QUANTITY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid quantity pattern"));

/// Header names of the columns the reader looks for.
///
/// The defaults match the Jimdo shop order export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub article: String,
    pub date: String,
    pub last_name: String,
    pub first_name: String,
    pub firm: String,
    pub email: String,
    pub quantity: String,
    /// Purchase type. Exports without this column import with no `achat`.
    pub achat: Option<String>,
}

impl Default for ColumnMap {
    fn default() -> Self {
        ColumnMap {
            article: "Article".to_string(),
            date: "Date de commande".to_string(),
            last_name: "Nom pour facturation".to_string(),
            first_name: "Prénom pour facturation".to_string(),
            firm: "Entreprise pour facturation".to_string(),
            email: "Email pour facturation".to_string(),
            quantity: "Déclinaison".to_string(),
            achat: Some("Achat".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    pub columns: ColumnMap,
    /// Rows above the header row (the Jimdo export starts with a title line).
    pub skip_rows: usize,
    /// Keep only rows whose article column equals this.
    pub article: Option<String>,
    /// Drop orders placed before this day.
    pub min_date: Option<NaiveDate>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        ImportOptions {
            columns: ColumnMap::default(),
            skip_rows: 1,
            article: None,
            min_date: None,
        }
    }
}

/// Column positions resolved from the header row.
struct Columns {
    article: Option<usize>,
    date: usize,
    last_name: usize,
    first_name: usize,
    firm: Option<usize>,
    email: usize,
    quantity: usize,
    achat: Option<usize>,
}

/// Parse an xlsx (or xls/ods) export held in memory into orders.
///
/// Nothing is returned unless the whole sheet parses, so a bad file never
/// reaches the store half-imported.
pub fn read_orders(bytes: &[u8], options: &ImportOptions) -> Result<Vec<NewOrder>, ParseError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| ParseError::Workbook(e.to_string()))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ParseError::NoSheet)?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ParseError::Workbook(e.to_string()))?;

    let orders = read_range(&range, options)?;
    info!("Parsed {} order(s) from sheet '{}'", orders.len(), sheet_name);
    Ok(orders)
}

pub fn read_orders_from_path(
    path: impl AsRef<Path>,
    options: &ImportOptions,
) -> Result<Vec<NewOrder>, ParseError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| ParseError::Workbook(format!("{}: {}", path.display(), e)))?;
    read_orders(&bytes, options)
}

fn read_range(range: &Range<Data>, options: &ImportOptions) -> Result<Vec<NewOrder>, ParseError> {
    // calamine ranges start at the first used cell, not at A1.
    let first_row = range.start().map_or(0, |(row, _)| row as usize);
    if options.skip_rows < first_row {
        return Err(ParseError::MissingHeader {
            row: options.skip_rows + 1,
        });
    }

    let mut rows = range
        .rows()
        .enumerate()
        .map(|(i, row)| (first_row + i + 1, row))
        .skip(options.skip_rows - first_row);

    let (_, header) = rows.next().ok_or(ParseError::MissingHeader {
        row: options.skip_rows + 1,
    })?;
    let columns = resolve_columns(header, options)?;

    let mut orders = Vec::new();
    for (row_number, row) in rows {
        if row.iter().all(|cell| cell_text(Some(cell)).is_empty()) {
            continue;
        }

        if let (Some(article), Some(col)) = (&options.article, columns.article) {
            if cell_text(row.get(col)) != article.trim() {
                continue;
            }
        }

        let date = parse_date(row.get(columns.date)).ok_or_else(|| ParseError::InvalidCell {
            row: row_number,
            column: options.columns.date.clone(),
            message: format!("unreadable date '{}'", cell_text(row.get(columns.date))),
        })?;
        if let Some(min_date) = options.min_date {
            if date.date() < min_date {
                debug!("Row {}: order dated {} is before {}, skipped", row_number, date, min_date);
                continue;
            }
        }

        let num_tickets = parse_quantity(row.get(columns.quantity)).map_err(
            |message| ParseError::InvalidCell {
                row: row_number,
                column: options.columns.quantity.clone(),
                message,
            },
        )?;

        let name = format!(
            "{} {}",
            cell_text(row.get(columns.last_name)),
            cell_text(row.get(columns.first_name))
        )
        .trim()
        .to_string();
        if name.is_empty() {
            return Err(ParseError::InvalidCell {
                row: row_number,
                column: options.columns.last_name.clone(),
                message: "buyer name is empty".to_string(),
            });
        }

        orders.push(NewOrder {
            date: date.format(DATE_FORMAT).to_string(),
            firm: optional_text(row, columns.firm),
            name,
            email: cell_text(row.get(columns.email)),
            num_tickets,
            achat: optional_text(row, columns.achat),
        });
    }

    Ok(orders)
}

fn resolve_columns(header: &[Data], options: &ImportOptions) -> Result<Columns, ParseError> {
    let find = |name: &str| {
        header
            .iter()
            .position(|cell| cell_text(Some(cell)).eq_ignore_ascii_case(name.trim()))
    };
    let require = |name: &str| {
        find(name).ok_or_else(|| ParseError::MissingColumn {
            column: name.to_string(),
        })
    };

    let map = &options.columns;
    let article = if options.article.is_some() {
        Some(require(&map.article)?)
    } else {
        find(&map.article)
    };

    Ok(Columns {
        article,
        date: require(&map.date)?,
        last_name: require(&map.last_name)?,
        first_name: require(&map.first_name)?,
        firm: find(&map.firm),
        email: require(&map.email)?,
        quantity: require(&map.quantity)?,
        achat: map.achat.as_deref().and_then(find),
    })
}

fn cell_text(cell: Option<&Data>) -> String {
    match cell {
        None | Some(Data::Empty) => String::new(),
        Some(cell) => cell.to_string().trim().to_string(),
    }
}

fn optional_text(row: &[Data], col: Option<usize>) -> Option<String> {
    let text = cell_text(col.and_then(|c| row.get(c)));
    (!text.is_empty()).then_some(text)
}

/// Ticket count of a cell: a number, or the first number in a variant label
/// such as "Lot de 5 billets".
fn parse_quantity(cell: Option<&Data>) -> Result<i64, String> {
    match cell {
        Some(Data::Int(n)) => Ok(*n),
        Some(Data::Float(f)) if f.fract() == 0.0 => Ok(*f as i64),
        Some(Data::Float(f)) => Err(format!("ticket quantity {} is not a whole number", f)),
        Some(Data::String(text)) => QUANTITY
            .find(text)
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .ok_or_else(|| format!("no ticket quantity in '{}'", text.trim())),
        None | Some(Data::Empty) => Err("ticket quantity is missing".to_string()),
        Some(other) => Err(format!("no ticket quantity in '{}'", other)),
    }
}

fn parse_date(cell: Option<&Data>) -> Option<NaiveDateTime> {
    match cell? {
        Data::String(text) => parse_date_text(text),
        Data::DateTimeIso(text) => parse_date_text(text),
        other => other.as_datetime(),
    }
}

fn parse_date_text(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    TEXT_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            TEXT_DAY_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
                .and_then(|day| day.and_hms_opt(0, 0, 0))
        })
}
