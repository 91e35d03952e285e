use thiserror::Error;

use crate::storage::pager::Pgno;

#[derive(Error, Debug)]
pub enum BtPageError {
    #[error("Corrupt database: {0}")]
    Corrupt(String),
    #[error("Database full: no page could be allocated")]
    Full,
    #[error("Page {0} is already checked out")]
    PageInUse(Pgno),
    #[error("I/O error: {0}")]
    IOError(std::io::ErrorKind),
}

impl From<std::io::Error> for BtPageError {
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value.kind())
    }
}

impl BtPageError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

#[macro_export]
macro_rules! bail_corrupt_error {
    ($($arg:tt)*) => {
        return Err($crate::error::BtPageError::Corrupt(format!($($arg)*)))
    }
}
