pub mod account;
pub mod booking;
pub mod invitation;
pub mod membership;
pub mod session;
pub mod tenant;
