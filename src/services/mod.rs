pub mod dispatch;
pub mod expiry;
pub mod gateway;
pub mod notify;
pub mod reconcile;
pub mod xml;
