//! Concrete [`RunLogger`](crate::logger::RunLogger) destinations.
//!
//! | type name       | logger                                     |
//! |-----------------|--------------------------------------------|
//! | `stdout`        | [`StdoutRunLogger`](crate::logger::StdoutRunLogger) |
//! | `shell`         | [`shell::ShellRunLogger`]                  |
//! | `http_json`     | [`http_json::HttpJsonRunLogger`]           |
//! | `google_sheets` | [`google_sheets::GoogleSheetsRunLogger`]   |
//! | `ecl`           | [`ecl::EclRunLogger`]                      |

pub mod ecl;
pub mod google_auth;
pub mod google_sheets;
pub mod http_json;
pub mod shell;

pub use ecl::EclRunLogger;
pub use google_sheets::GoogleSheetsRunLogger;
pub use http_json::HttpJsonRunLogger;
pub use shell::ShellRunLogger;
