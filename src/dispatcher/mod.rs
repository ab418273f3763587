use crate::protocol::{self, EventAction, RequestAction};
use crate::transport::Transport;
use std::time::Duration;
use tokio::sync::Mutex;

/// Where the backend lives. Mutable between connections only; changing it
/// never re-points a live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

struct Slot {
    endpoint: Endpoint,
    transport: Option<Transport>,
}

/// Translates named operations into wire packets, lazily (re)establishing
/// the transport. The slot lock makes reconnection atomic with request
/// issuance, so two callers can never both decide to rebuild the stream.
pub struct CommandDispatcher {
    slot: Mutex<Slot>,
    exchange_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(endpoint: Endpoint, exchange_timeout: Duration) -> Self {
        Self {
            slot: Mutex::new(Slot {
                endpoint,
                transport: None,
            }),
            exchange_timeout,
        }
    }

    /// Closes the current connection and records the new endpoint; it takes
    /// effect on the next operation.
    pub async fn set_endpoint(&self, endpoint: Endpoint) {
        let mut slot = self.slot.lock().await;
        if let Some(transport) = slot.transport.take() {
            transport.close().await;
        }
        tracing::info!(address = %endpoint.address, port = endpoint.port, "endpoint updated");
        slot.endpoint = endpoint;
    }

    pub async fn endpoint(&self) -> Endpoint {
        self.slot.lock().await.endpoint.clone()
    }

    /// Discards the transport; the next operation reconnects.
    pub async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(transport) = slot.transport.take() {
            transport.close().await;
        }
    }

    /// Liveness probe independent of state semantics.
    pub async fn check_connected(&self) -> bool {
        self.ping().await.is_some()
    }

    pub async fn ping(&self) -> Option<bool> {
        self.request(RequestAction::Ping).await.map(|(status, _)| status)
    }

    pub async fn is_replay_buffer_active(&self) -> Option<bool> {
        self.request(RequestAction::ReplayBufferActive)
            .await
            .map(|(status, _)| status)
    }

    pub async fn is_recording_active(&self) -> Option<bool> {
        self.request(RequestAction::RecordingActive)
            .await
            .map(|(status, _)| status)
    }

    pub async fn is_streaming_active(&self) -> Option<bool> {
        self.request(RequestAction::StreamingActive)
            .await
            .map(|(status, _)| status)
    }

    pub async fn get_current_scene(&self) -> Option<(bool, String)> {
        self.request(RequestAction::GetCurrentScene).await
    }

    pub async fn get_scenes(&self) -> Option<(bool, String)> {
        self.request(RequestAction::GetScenes).await
    }

    pub async fn start_replay_buffer(&self) -> Option<bool> {
        self.event(EventAction::StartReplayBuffer, "").await
    }

    pub async fn stop_replay_buffer(&self) -> Option<bool> {
        self.event(EventAction::StopReplayBuffer, "").await
    }

    pub async fn save_replay_buffer(&self) -> Option<bool> {
        self.event(EventAction::SaveReplayBuffer, "").await
    }

    pub async fn start_recording(&self) -> Option<bool> {
        self.event(EventAction::StartRecording, "").await
    }

    pub async fn stop_recording(&self) -> Option<bool> {
        self.event(EventAction::StopRecording, "").await
    }

    pub async fn split_recording(&self) -> Option<bool> {
        self.event(EventAction::RecordingSplitFile, "").await
    }

    pub async fn start_streaming(&self) -> Option<bool> {
        self.event(EventAction::StartStreaming, "").await
    }

    pub async fn stop_streaming(&self) -> Option<bool> {
        self.event(EventAction::StopStreaming, "").await
    }

    pub async fn set_scene(&self, name: &str) -> Option<bool> {
        self.event(EventAction::SetScene, name).await
    }

    /// Query flow: returns the decoded status bit plus the response payload
    /// trimmed of trailing delimiter bytes. `None` means the operation could
    /// not complete (no connection, or no/empty response).
    async fn request(&self, action: RequestAction) -> Option<(bool, String)> {
        let response = self.dispatch(protocol::request_packet(action)).await?;
        let status = protocol::reply_status(&response)?;
        Some((status, protocol::reply_payload(&response)))
    }

    async fn event(&self, action: EventAction, payload: &str) -> Option<bool> {
        let response = self.dispatch(protocol::event_packet(action, payload)).await?;
        protocol::reply_status(&response)
    }

    async fn dispatch(&self, packet: Vec<u8>) -> Option<Vec<u8>> {
        let mut slot = self.slot.lock().await;

        if !slot
            .transport
            .as_ref()
            .is_some_and(Transport::is_connected)
        {
            if let Some(stale) = slot.transport.take() {
                stale.close().await;
            }
            match Transport::connect(&slot.endpoint.address, slot.endpoint.port).await {
                Ok(transport) => slot.transport = Some(transport),
                Err(err) => {
                    tracing::debug!(
                        address = %slot.endpoint.address,
                        port = slot.endpoint.port,
                        error = %err,
                        "connect failed"
                    );
                    return None;
                }
            }
        }

        let transport = slot.transport.as_ref()?;
        match transport.exchange(&packet, self.exchange_timeout).await {
            Ok(response) if !response.is_empty() => Some(response),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!(error = %err, "exchange failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TEST_TIMEOUT: Duration = Duration::from_millis(500);

    /// Minimal backend fake: answers every packet on a connection with the
    /// given response bytes, accepting reconnections.
    async fn spawn_backend(responses: &'static [u8]) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut peer, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    while let Ok(n) = peer.read(&mut buf).await {
                        if n == 0 {
                            return;
                        }
                        if peer.write_all(responses).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        Endpoint {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }

    fn unreachable_endpoint() -> Endpoint {
        Endpoint {
            address: "127.0.0.1".to_string(),
            port: 1,
        }
    }

    #[tokio::test]
    async fn request_decodes_active_status() {
        let endpoint = spawn_backend(&[0x40]).await;
        let dispatcher = CommandDispatcher::new(endpoint, TEST_TIMEOUT);
        assert_eq!(dispatcher.is_replay_buffer_active().await, Some(true));
        assert_eq!(dispatcher.is_recording_active().await, Some(true));
    }

    #[tokio::test]
    async fn request_decodes_inactive_status() {
        let endpoint = spawn_backend(&[0x00]).await;
        let dispatcher = CommandDispatcher::new(endpoint, TEST_TIMEOUT);
        assert_eq!(dispatcher.is_streaming_active().await, Some(false));
    }

    #[tokio::test]
    async fn unreachable_backend_yields_none_without_panic() {
        let dispatcher = CommandDispatcher::new(unreachable_endpoint(), TEST_TIMEOUT);
        assert_eq!(dispatcher.is_replay_buffer_active().await, None);
        assert_eq!(dispatcher.start_recording().await, None);
        assert!(!dispatcher.check_connected().await);
    }

    #[tokio::test]
    async fn scene_query_trims_trailing_delimiter() {
        let endpoint = spawn_backend(b"\x40Main Scene\n").await;
        let dispatcher = CommandDispatcher::new(endpoint, TEST_TIMEOUT);
        let (status, scene) = dispatcher.get_current_scene().await.unwrap();
        assert!(status);
        assert_eq!(scene, "Main Scene");
    }

    #[tokio::test]
    async fn scene_list_payload_parses_nul_separated_names() {
        let endpoint = spawn_backend(b"\x40Scene A\0Scene B\0").await;
        let dispatcher = CommandDispatcher::new(endpoint, TEST_TIMEOUT);
        let (status, payload) = dispatcher.get_scenes().await.unwrap();
        assert!(status);
        assert_eq!(
            protocol::parse_scene_list(&payload),
            vec!["Scene A", "Scene B"]
        );
    }

    #[tokio::test]
    async fn reconnects_after_close() {
        let endpoint = spawn_backend(&[0x40]).await;
        let dispatcher = CommandDispatcher::new(endpoint, TEST_TIMEOUT);
        assert_eq!(dispatcher.ping().await, Some(true));
        dispatcher.close().await;
        assert_eq!(dispatcher.ping().await, Some(true));
    }

    #[tokio::test]
    async fn endpoint_change_takes_effect_on_next_use() {
        let first = spawn_backend(&[0x00]).await;
        let second = spawn_backend(&[0x40]).await;
        let dispatcher = CommandDispatcher::new(first, TEST_TIMEOUT);
        assert_eq!(dispatcher.is_recording_active().await, Some(false));

        dispatcher.set_endpoint(second.clone()).await;
        assert_eq!(dispatcher.endpoint().await, second);
        assert_eq!(dispatcher.is_recording_active().await, Some(true));
    }

    #[tokio::test]
    async fn event_operations_decode_acknowledgement() {
        let endpoint = spawn_backend(&[0x40]).await;
        let dispatcher = CommandDispatcher::new(endpoint, TEST_TIMEOUT);
        assert_eq!(dispatcher.start_replay_buffer().await, Some(true));
        assert_eq!(dispatcher.save_replay_buffer().await, Some(true));
        assert_eq!(dispatcher.split_recording().await, Some(true));
        assert_eq!(dispatcher.set_scene("Gameplay").await, Some(true));
    }
}
