pub mod pagination;
pub mod snowflake;
pub mod validation;

pub use pagination::PagePlan;
pub use snowflake::{
    ApplicationId, ChannelId, CommandId, EventId, GuildId, InteractionId, MessageId, RoleId,
    Snowflake, UserId, WebhookId,
};
pub use validation::ValidationError;
