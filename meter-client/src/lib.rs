pub mod db;
pub mod domain;

pub use domain::{Alert, AlertType, MeterSnapshot, MeterState, ParseAlertTypeError, Reading};
