//! Process-level loop: bootstrap, connect, poll, reconnect

use crate::client::{GatewayClient, GatewayConfig, PollOutcome};
use crate::error::GatewayError;
use crate::protocol::NORMAL_CLOSE;
use crate::reconnect::{ExponentialBackoff, ReconnectionStrategy};
use anyhow::Context;
use cordlink_common::AppConfig;
use cordlink_http::{HttpClient, HttpHandle};

/// Run a gateway session until a fatal error or Ctrl-C
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let http = HttpClient::new(Some(config.bot.token.clone())).with_base_url(config.bot.api_base.clone());
    let url = resolve_gateway_url(&http).await?;

    let gateway = GatewayConfig::from_app_config(&config, url);
    let mut client = GatewayClient::new(gateway)
        .with_http(HttpHandle::owned(http))
        .with_dispatcher(|event, data| {
            tracing::debug!(event, size = data.to_string().len(), "Dispatch");
        });
    let backoff = ExponentialBackoff::from_config(&config.reconnect);

    let outcome = tokio::select! {
        result = drive(&mut client, &backoff) => result.context("gateway session ended"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("Shutdown requested");
            Ok(())
        }
    };

    client.close(Some(NORMAL_CLOSE)).await;
    outcome
}

/// Ask the REST API where to connect
///
/// Falls back to the unauthenticated endpoint when the bot endpoint fails.
pub async fn resolve_gateway_url(http: &HttpClient) -> anyhow::Result<String> {
    match http.get_bot_gateway().await {
        Ok(info) => {
            let limit = info.session_start_limit;
            tracing::info!(
                url = %info.url,
                shards = info.shards,
                remaining = limit.remaining,
                total = limit.total,
                "Gateway bootstrap"
            );
            if !limit.can_start() {
                tracing::warn!(reset_after_ms = limit.reset_after, "Session start limit exhausted");
            }
            Ok(info.url)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Bot gateway lookup failed, using public endpoint");
            let info = http.get_gateway().await.context("gateway lookup failed")?;
            Ok(info.url)
        }
    }
}

/// Keep a client connected, resuming where possible
///
/// Returns when the session ends fatally or the strategy gives up. A
/// non-resumable invalid session is retried with a fresh Identify.
pub async fn drive<R>(client: &mut GatewayClient, strategy: &R) -> Result<(), GatewayError>
where
    R: ReconnectionStrategy + ?Sized,
{
    let mut resume = false;
    let mut attempt = 0usize;

    loop {
        let error = match client.connect(resume).await {
            Ok(()) => {
                attempt = 0;
                loop {
                    match client.poll_once().await {
                        PollOutcome::Continue => {}
                        PollOutcome::Reconnect(e) => {
                            resume = true;
                            break e;
                        }
                        PollOutcome::Fatal(e) if e.allows_reidentify() => {
                            resume = false;
                            break e;
                        }
                        PollOutcome::Fatal(e) => return Err(e),
                    }
                }
            }
            Err(e) if e.is_reconnectable() => e,
            Err(e) => return Err(e),
        };

        let Some(delay) = strategy.next_delay(attempt) else {
            tracing::error!(error = %error, attempt, "Giving up on gateway");
            return Err(error);
        };

        tracing::warn!(
            error = %error,
            attempt,
            resume,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to gateway"
        );
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}
