pub mod auth;
pub mod messaging;
pub mod role_groups;
pub mod unread;

pub use auth::{AuthService, Claims};
pub use messaging::MessagingService;
pub use role_groups::RoleGroupResolver;
pub use unread::UnreadTracker;
