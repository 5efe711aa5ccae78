pub mod constraints;
pub mod deviation;
pub mod forecast;
pub mod pump;
pub mod schedule;
pub mod tags;
pub mod tunnel;

pub use constraints::*;
pub use deviation::*;
pub use forecast::*;
pub use pump::*;
pub use schedule::*;
pub use tags::*;
pub use tunnel::*;
