//! Per-connection state and the dispatcher/streaming logic that operate on
//! it (C5's connection-scoped registry, C6's client session behavior, and
//! C7's routing), grounded on `ws_forwarder.rs`'s single-connection handler
//! and on `state.rs`'s `RwLock`-guarded shared-session-state pattern.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::Message;
use fx_core::models::{Asset, Point};
use fx_protocol::{Envelope, PointPayload};
use sqlx::PgPool;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;

/// 30 minutes, per the history window fixed in the subscribe contract.
const HISTORY_WINDOW_SECS: i64 = 30 * 60;
/// Poll cadence when the producer has no fresher point to offer.
const FALLBACK_POLL: std::time::Duration = std::time::Duration::from_millis(200);

pub type Outbox = mpsc::UnboundedSender<Message>;

fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() as i64
}

/// The `current_asset` slot shared between the dispatcher task (writer) and
/// the streaming task (reader). `RwLock` rather than a bare atomic because
/// the async runtime needs an awaitable guard at the read site; see
/// `state.rs`'s `broadcast_registry` for the same tradeoff made elsewhere
/// in this codebase.
#[derive(Clone)]
struct CurrentAsset(Arc<RwLock<Option<i32>>>);

impl CurrentAsset {
    fn new() -> Self {
        Self(Arc::new(RwLock::new(None)))
    }

    async fn get(&self) -> Option<i32> {
        *self.0.read().await
    }

    async fn set(&self, value: Option<i32>) {
        *self.0.write().await = value;
    }
}

/// Per-connection session state: the last accepted command's action name,
/// the subscription target, and the handle of any spawned streaming task.
pub struct ConnectionState {
    current_asset: CurrentAsset,
    latest_command: Mutex<Option<String>>,
    stream_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            current_asset: CurrentAsset::new(),
            latest_command: Mutex::new(None),
            stream_task: Mutex::new(None),
        }
    }

    async fn latest_command_was(&self, action: &str) -> bool {
        self.latest_command.lock().await.as_deref() == Some(action)
    }

    async fn set_latest_command(&self, action: &str) {
        *self.latest_command.lock().await = Some(action.to_owned());
    }

    /// Cancel every task registered with this connection. Called on
    /// disconnect; idempotent.
    pub async fn cancel_all_tasks(&self) {
        if let Some(handle) = self.stream_task.lock().await.take() {
            handle.abort();
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch one fully-decoded command (C7). `action` routing per the spec's
/// state machine: `assets` clears any active subscription binding,
/// `subscribe` either swaps the binding in place or spawns the streaming
/// task, anything else is a one-error echo that leaves `latest_command`
/// untouched.
pub async fn dispatch(
    pool: &PgPool,
    conn: &Arc<ConnectionState>,
    outbox: &Outbox,
    action: &str,
    message: &serde_json::Map<String, serde_json::Value>,
) {
    match action {
        "assets" => {
            if conn.latest_command_was("subscribe").await {
                conn.current_asset.set(None).await;
                // A later subscribe may spawn a new task immediately; abort
                // here instead of waiting for the old one to notice current_asset == null.
                if let Some(handle) = conn.stream_task.lock().await.take() {
                    handle.abort();
                }
            }
            send_assets(pool, outbox).await;
            conn.set_latest_command("assets").await;
        }
        "subscribe" => {
            let request = match fx_protocol::parse_subscribe_request(message) {
                Ok(r) => r,
                Err(errors) => {
                    send(outbox, Envelope::errors("subscribe", errors));
                    return;
                }
            };
            let asset_id = match i32::try_from(request.asset_id) {
                Ok(id) => id,
                Err(_) => {
                    send(outbox, Envelope::single_error("subscribe", "Asset not found"));
                    return;
                }
            };
            match fx_core::store::find_asset_by_id(pool, asset_id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    send(outbox, Envelope::single_error("subscribe", "Asset not found"));
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "store error while resolving subscribe target");
                    send(outbox, Envelope::single_error("subscribe", "Asset not found"));
                    return;
                }
            }

            conn.current_asset.set(Some(asset_id)).await;

            let already_streaming = conn.latest_command_was("subscribe").await;
            if !already_streaming {
                let handle = tokio::spawn(run_subscription_stream(
                    pool.clone(),
                    conn.current_asset.clone(),
                    outbox.clone(),
                ));
                let mut guard = conn.stream_task.lock().await;
                debug_assert!(guard.is_none(), "Idle state must have no prior stream task");
                *guard = Some(handle);
            }
            conn.set_latest_command("subscribe").await;
        }
        other => {
            send(outbox, Envelope::single_error(other, "Unknown action"));
        }
    }
}

async fn send_assets(pool: &PgPool, outbox: &Outbox) {
    match fx_core::store::list_assets(pool).await {
        Ok(assets) => {
            let payload = assets
                .into_iter()
                .map(|Asset { id, name }| fx_protocol::AssetInfo { id, name })
                .collect();
            send(outbox, Envelope::assets(payload));
        }
        Err(err) => {
            warn!(error = %err, "store error while listing assets");
        }
    }
}

fn send(outbox: &Outbox, envelope: Envelope) {
    if let Ok(text) = serde_json::to_string(&envelope) {
        let _ = outbox.send(Message::Text(text.into()));
    }
}

/// C6's `subscribe_stream`, realized as the long-lived task spawned on the
/// first `subscribe`. Re-reads `current_asset` at the top of every
/// iteration rather than capturing it once, which is what lets the
/// dispatcher hot-swap the target without restarting this task.
async fn run_subscription_stream(pool: PgPool, current_asset: CurrentAsset, outbox: Outbox) {
    let mut bound_asset: Option<i32> = None;
    let mut anchor: Option<Point> = None;
    let mut asset_name = String::new();

    loop {
        let Some(asset_id) = current_asset.get().await else {
            return;
        };

        if bound_asset.is_none() {
            let Ok(Some(asset)) = fx_core::store::find_asset_by_id(&pool, asset_id).await else {
                return;
            };
            asset_name = asset.name;
            bound_asset = Some(asset_id);

            let since = now_secs() - HISTORY_WINDOW_SECS;
            let points = match fx_core::store::history(&pool, asset_id, since).await {
                Ok(points) => points,
                Err(err) => {
                    warn!(error = %err, "store error while fetching history");
                    return;
                }
            };

            if points.is_empty() {
                send(&outbox, Envelope::single_error("points", "No points to return"));
                return;
            }

            anchor = Some(points[0]);
            let payload = points.iter().map(|p| point_payload(&asset_name, p)).collect();
            send(&outbox, Envelope::asset_history(payload));
            continue;
        }

        if bound_asset != Some(asset_id) {
            // A hot-swap mid-stream: re-bind to the new asset but leave
            // `anchor` as-is and never re-query history or emit a second
            // `asset_history`. The next `latest_point` poll below compares
            // against the old asset's anchor, which never matches the new
            // asset's rows, so the first differing point on the new asset
            // is emitted as a plain `point` — exactly the re-subscribe-
            // without-restart contract.
            let Ok(Some(asset)) = fx_core::store::find_asset_by_id(&pool, asset_id).await else {
                return;
            };
            asset_name = asset.name;
            bound_asset = Some(asset_id);
        }

        let latest = match fx_core::store::latest_point(&pool, asset_id).await {
            Ok(latest) => latest,
            Err(err) => {
                warn!(error = %err, "store error while polling latest point");
                return;
            }
        };

        if let Some(point) = latest {
            if anchor.map(|a| a.id) != Some(point.id) {
                anchor = Some(point);
                send(&outbox, Envelope::point(point_payload(&asset_name, &point)));
            }
        }

        let delay = anchor.map_or(0, |a| a.time + 1 - now_secs());
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_secs(delay as u64)).await;
        } else {
            tokio::time::sleep(FALLBACK_POLL).await;
        }
    }
}

fn point_payload(asset_name: &str, point: &Point) -> PointPayload {
    PointPayload {
        asset_name: asset_name.to_owned(),
        asset_id: point.asset_id,
        time: point.time,
        value: point.value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn current_asset_starts_unset() {
        let slot = CurrentAsset::new();
        assert_eq!(slot.get().await, None);
        slot.set(Some(7)).await;
        assert_eq!(slot.get().await, Some(7));
        slot.set(None).await;
        assert_eq!(slot.get().await, None);
    }

    #[tokio::test]
    async fn latest_command_tracks_only_the_last_set_value() {
        let conn = ConnectionState::new();
        assert!(!conn.latest_command_was("subscribe").await);
        conn.set_latest_command("subscribe").await;
        assert!(conn.latest_command_was("subscribe").await);
        assert!(!conn.latest_command_was("assets").await);
    }

    #[tokio::test]
    async fn cancel_all_tasks_is_idempotent_with_nothing_registered() {
        let conn = ConnectionState::new();
        conn.cancel_all_tasks().await;
        conn.cancel_all_tasks().await;
    }
}
