pub mod estimator;
pub mod notification;
pub mod queue;

pub use estimator::*;
pub use notification::*;
pub use queue::*;
