//! HTTP admission control for axum applications.

mod classify;
mod layer;
mod throttle;

pub use classify::{CookieClassifier, RequestClassifier};
pub use layer::{admission_middleware, names, LoadShedder, BUSY_BODY};
pub use throttle::{WarnClass, WarnThrottle};
