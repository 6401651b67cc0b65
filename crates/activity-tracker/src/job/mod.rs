pub mod activity;
pub mod record;
pub mod status;

pub use activity::{Activity, ActivityKind};
pub use record::{JobParameters, JobRecord};
pub use status::JobStatus;
