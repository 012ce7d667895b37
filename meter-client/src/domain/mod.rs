mod alert;
mod meter_state;
mod reading;

pub use alert::{Alert, AlertType, ParseAlertTypeError};
pub use meter_state::{MeterSnapshot, MeterState};
pub use reading::Reading;
