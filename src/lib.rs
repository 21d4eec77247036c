/*!
# Tombola

A small ticket office for a charity raffle, built in Rust.

## Overview

Raffle tickets are sold through a Jimdo web shop. The shop's order export
(an xlsx workbook) is uploaded here; every order for the raffle article is
stored once, keyed by buyer name and order date, and expanded into
sequentially numbered tickets ready for printing. Buyers can be emailed the
numbers of their tickets.

## Architecture

### Import
- **loader**: reads the Jimdo export with calamine, filters by article and
  order date, parses the ticket quantity from the variant column
- **order**: `Order` and `NewOrder` with their validation rules

### Storage
- **store**: SQLite through sqlx; idempotent upserts on `(name, date)`

### Tickets
- **tickets**: lazy expansion of orders into `TICKET_0001`, `TICKET_0002`, ...
  in `(date, name)` order
- **downloader**: one row per ticket, as xlsx or CSV

### Web (feature `web`)
- **app**: axum router, handlers and shared state
- **login**: optional single-operator login with argon2 and a session cookie
- **mailer**: ticket confirmation emails through lettre

### Support
- **config**: environment and `.env` settings
- **error**: `TombolaError` and `ParseError`

## Binaries

- `website`: the web ticket office
- `tombola-cli`: import, export and list from a terminal
*/

pub mod config;
pub mod downloader;
pub mod error;
pub mod loader;
pub mod order;
pub mod store;
pub mod tickets;

#[cfg(feature = "web")]
pub mod app;
#[cfg(feature = "web")]
pub mod login;
#[cfg(feature = "web")]
pub mod mailer;
