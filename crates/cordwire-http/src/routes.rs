use cordwire_models::gateway::{GatewayBot, GatewayInfo};
use cordwire_models::message::{EditMessage, Message, SendMessage};
use cordwire_models::user::{Member, PartialGuild};
use cordwire_models::voice::VoiceRegion;
use cordwire_util::{ChannelId, GuildId, MessageId, PagePlan, UserId};
use reqwest::Method;
use serde::Serialize;

use crate::client::Client;
use crate::error::HttpError;
use crate::request::RequestOptions;
use crate::transport::RateLimitedTransport;

pub const MESSAGES_PAGE_LIMIT: u32 = 100;
pub const MEMBERS_PAGE_LIMIT: u32 = 1000;
pub const GUILDS_PAGE_LIMIT: u32 = 200;
/// Bulk delete accepts between 2 and this many ids.
pub const BULK_DELETE_MAX: usize = 100;

#[derive(Serialize)]
struct PageQuery<C: Serialize> {
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<C>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<C>,
}

#[derive(Serialize)]
struct BulkDelete<'a> {
    messages: &'a [MessageId],
}

impl<T: RateLimitedTransport> Client<T> {
    /// `GET /gateway`
    pub async fn gateway(&self) -> Result<GatewayInfo, HttpError> {
        self.json(Method::GET, "gateway", RequestOptions::new()).await
    }

    /// `GET /gateway/bot`, including the recommended shard count and
    /// identify limits.
    pub async fn gateway_bot(&self) -> Result<GatewayBot, HttpError> {
        self.json(Method::GET, "gateway/bot", RequestOptions::new()).await
    }

    pub async fn send_message(
        &self,
        channel_id: ChannelId,
        message: &SendMessage,
    ) -> Result<Message, HttpError> {
        message.validate()?;
        let options = RequestOptions::new().multipart(message, message.files.clone())?;
        self.json(Method::POST, &format!("channels/{channel_id}/messages"), options)
            .await
    }

    pub async fn edit_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        edit: &EditMessage,
    ) -> Result<Message, HttpError> {
        edit.validate()?;
        let options = RequestOptions::new().json(edit)?;
        self.json(
            Method::PATCH,
            &format!("channels/{channel_id}/messages/{message_id}"),
            options,
        )
        .await
    }

    pub async fn delete_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        reason: Option<&str>,
    ) -> Result<(), HttpError> {
        let options = RequestOptions::new().maybe_reason(reason)?;
        self.fast_request(
            Method::DELETE,
            &format!("channels/{channel_id}/messages/{message_id}"),
            options,
        )
        .await
    }

    /// Delete many messages: nothing for an empty slice, a single delete for
    /// one id, otherwise bulk deletes of at most 100 ids each.
    pub async fn delete_messages(
        &self,
        channel_id: ChannelId,
        message_ids: &[MessageId],
        reason: Option<&str>,
    ) -> Result<(), HttpError> {
        for chunk in message_ids.chunks(BULK_DELETE_MAX) {
            if let [single] = chunk {
                self.delete_message(channel_id, *single, reason).await?;
                continue;
            }
            let options = RequestOptions::new()
                .json(&BulkDelete { messages: chunk })?
                .maybe_reason(reason)?;
            self.fast_request(
                Method::POST,
                &format!("channels/{channel_id}/messages/bulk-delete"),
                options,
            )
            .await?;
        }
        Ok(())
    }

    /// Channel history, newest first, walking backwards from `before`.
    /// A `limit` of 0 fetches everything.
    pub async fn messages(
        &self,
        channel_id: ChannelId,
        limit: u32,
        mut before: Option<MessageId>,
    ) -> Result<Vec<Message>, HttpError> {
        let path = format!("channels/{channel_id}/messages");
        let mut plan = PagePlan::new(limit, MESSAGES_PAGE_LIMIT);
        let mut out = Vec::new();

        while let Some(page_size) = plan.next_page() {
            let query = PageQuery {
                limit: page_size,
                before,
                after: None,
            };
            let page: Vec<Message> = self
                .json(Method::GET, &path, RequestOptions::new().query(&query)?)
                .await?;
            plan.record(page.len());
            before = page.last().map(|m| m.id);
            out.extend(page);
            if before.is_none() {
                break;
            }
        }
        Ok(out)
    }

    /// Guild members ordered by user id, starting after `after`.
    pub async fn members(
        &self,
        guild_id: GuildId,
        limit: u32,
        mut after: Option<UserId>,
    ) -> Result<Vec<Member>, HttpError> {
        let path = format!("guilds/{guild_id}/members");
        let mut plan = PagePlan::new(limit, MEMBERS_PAGE_LIMIT);
        let mut out = Vec::new();

        while let Some(page_size) = plan.next_page() {
            let query = PageQuery {
                limit: page_size,
                before: None,
                after,
            };
            let page: Vec<Member> = self
                .json(Method::GET, &path, RequestOptions::new().query(&query)?)
                .await?;
            plan.record(page.len());
            after = page
                .last()
                .and_then(|m| m.user.as_ref())
                .map(|u| u.id);
            out.extend(page);
            if after.is_none() {
                break;
            }
        }
        Ok(out)
    }

    /// Guilds of the current user, starting after `after`.
    pub async fn current_user_guilds(
        &self,
        limit: u32,
        mut after: Option<GuildId>,
    ) -> Result<Vec<PartialGuild>, HttpError> {
        let mut plan = PagePlan::new(limit, GUILDS_PAGE_LIMIT);
        let mut out = Vec::new();

        while let Some(page_size) = plan.next_page() {
            let query = PageQuery {
                limit: page_size,
                before: None,
                after,
            };
            let page: Vec<PartialGuild> = self
                .json(
                    Method::GET,
                    "users/@me/guilds",
                    RequestOptions::new().query(&query)?,
                )
                .await?;
            plan.record(page.len());
            after = page.last().map(|g| g.id);
            out.extend(page);
            if after.is_none() {
                break;
            }
        }
        Ok(out)
    }

    pub async fn voice_regions(&self) -> Result<Vec<VoiceRegion>, HttpError> {
        self.json(Method::GET, "voice/regions", RequestOptions::new())
            .await
    }
}
