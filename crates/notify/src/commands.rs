use std::sync::Arc;

use teloxide::{dispatching::UpdateHandler, prelude::*, utils::command::BotCommands};
use tracing::{info, warn};

use queue::EventQueue;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Dependencies injected into every handler via `dptree`.
#[derive(Clone)]
pub struct BotDeps {
    pub queue: Arc<EventQueue>,
    /// Admin Telegram user ids allowed to run `/health` and `/coverage`.
    pub admin_user_ids: Arc<Vec<i64>>,
}

/// Bot commands exposed to end users and admins. Unlike the teacher's
/// trading-engine commands (start/stop/status/reset_drawdown) this bot
/// only links accounts and reports health — the scanner itself is driven
/// entirely by the scheduler, never by chat commands.
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "signalscan commands:")]
pub enum Command {
    #[command(description = "Link this chat to your account: /connect <token>")]
    Connect(String),
    #[command(description = "Show scanner health (admin only)")]
    Health,
}

/// Start the Telegram bot in long-polling mode.
pub async fn start_bot(token: String, deps: BotDeps) {
    let bot = Bot::new(token);
    let deps = Arc::new(deps);

    info!("Telegram bot starting (long-polling)");

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![deps])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync>> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Connect(token)].endpoint(handle_connect))
        .branch(case![Command::Health].endpoint(handle_health));

    Update::filter_message().branch(command_handler)
}

async fn handle_connect(bot: Bot, msg: Message, deps: Arc<BotDeps>, token: String) -> HandlerResult {
    let token = token.trim();
    if token.is_empty() {
        bot.send_message(msg.chat.id, "Usage: /connect <token>").await?;
        return Ok(());
    }

    let now = now_unix();
    match deps.queue.validate_connect_token(token, now).await {
        Ok(Some(user_id)) => {
            let chat_id = msg.chat.id.0;
            if let Err(e) = deps.queue.link_telegram(&user_id, chat_id, now).await {
                warn!(error = %e, "failed to persist telegram link");
                bot.send_message(msg.chat.id, "Connection failed, try again later.").await?;
                return Ok(());
            }
            info!(user_id = %user_id, chat_id, "telegram account linked");
            bot.send_message(msg.chat.id, "Account connected. You'll receive signal alerts here.").await?;
        }
        Ok(None) => {
            bot.send_message(msg.chat.id, "That token is invalid or has expired.").await?;
        }
        Err(e) => {
            warn!(error = %e, "connect token validation failed");
            bot.send_message(msg.chat.id, "Connection failed, try again later.").await?;
        }
    }
    Ok(())
}

async fn handle_health(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let uid = msg.from().map(|u| u.id.0 as i64).unwrap_or(0);
    if !deps.admin_user_ids.contains(&uid) {
        warn!(user_id = uid, "unauthorized /health attempt");
        return Ok(());
    }

    let stats = deps.queue.queue_stats().await.unwrap_or_default();
    let text = format!(
        "Queue: NEW={} PROCESSING={} DONE={} FAILED={}",
        stats.get("NEW").copied().unwrap_or(0),
        stats.get("PROCESSING").copied().unwrap_or(0),
        stats.get("DONE").copied().unwrap_or(0),
        stats.get("FAILED").copied().unwrap_or(0),
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
