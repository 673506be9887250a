//! Render scheduling and the render+publish collaborator.

mod publisher;
mod scheduler;

pub use publisher::{CommandPublisher, Publisher, RenderScope};
pub use scheduler::{RenderScheduler, SchedulerConfig, Step};
