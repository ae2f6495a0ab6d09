pub mod notify;
pub mod summary;

pub use notify::NotificationWorker;
pub use summary::SummaryWorker;
