pub mod audit;
pub mod classification;
pub mod request;

pub use audit::*;
pub use classification::*;
pub use request::*;
