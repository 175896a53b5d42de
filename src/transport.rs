pub use chatwire_tokio_transport::{
    TokioWebSocketTransport, TokioWebSocketTransportFactory, Transport, TransportEvent,
    TransportFactory,
};

#[cfg(test)]
pub mod mock {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::{Mutex, mpsc};

    /// A scriptable in-memory transport: records outbound frames and lets
    /// tests inject inbound events.
    pub struct MockTransport {
        pub sent: Arc<Mutex<Vec<String>>>,
        pub fail_sends: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
            if self.fail_sends {
                return Err(anyhow::anyhow!("mock send failure"));
            }
            self.sent.lock().await.push(frame.to_owned());
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    /// Factory yielding mock transports plus a handle to drive each one.
    pub struct MockTransportFactory {
        handles_tx: mpsc::UnboundedSender<MockConnectionHandle>,
    }

    /// Test-side view of one created connection.
    pub struct MockConnectionHandle {
        pub sent: Arc<Mutex<Vec<String>>>,
        pub events: mpsc::Sender<TransportEvent>,
    }

    impl MockTransportFactory {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<MockConnectionHandle>) {
            let (handles_tx, handles_rx) = mpsc::unbounded_channel();
            (Self { handles_tx }, handles_rx)
        }
    }

    #[async_trait]
    impl TransportFactory for MockTransportFactory {
        async fn create_transport(
            &self,
        ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
            let (event_tx, event_rx) = mpsc::channel(100);
            let sent = Arc::new(Mutex::new(Vec::new()));
            let transport = Arc::new(MockTransport {
                sent: sent.clone(),
                fail_sends: false,
            });
            let _ = event_tx.send(TransportEvent::Connected).await;
            let _ = self.handles_tx.send(MockConnectionHandle {
                sent,
                events: event_tx,
            });
            Ok((transport, event_rx))
        }
    }
}
