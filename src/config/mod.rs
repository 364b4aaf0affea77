pub mod schema;

pub use schema::{
    AccountConfig, Config, DeliveryConfig, EmailConfig, GatewayConfig, MediaConfig,
    PlatformCredentials, ReconnectOverride, TelegramBotConfig, TelegramUserConfig, UpdateMode,
    WhatsAppBusinessConfig, WhatsAppWebConfig,
};
