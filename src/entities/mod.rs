pub mod api_key;
pub mod device_code;
pub mod session;
pub mod user;

pub use api_key::Entity as ApiKey;
pub use device_code::Entity as DeviceCode;
pub use session::Entity as Session;
pub use user::Entity as User;
