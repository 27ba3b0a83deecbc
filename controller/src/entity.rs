pub mod client_traffic;
pub mod inbound;
pub mod system_config;

pub use client_traffic::Entity as ClientTraffic;
pub use inbound::Entity as Inbound;
pub use system_config::Entity as SystemConfig;
