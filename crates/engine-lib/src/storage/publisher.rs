//! Alert publishing to blob storage plus per-alert events

use super::{AlertPublisher, BlobStore, EventSink, StoreError};
use crate::models::CanonicalAlert;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Notification emitted for every published alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub detector_id: String,
    pub alert_id: String,
    pub path: String,
    pub correlation_hash: String,
    pub resource_id: String,
}

/// Writes each alert as a JSON blob at `alerts/<detector>/<date>/<id>.json`
/// and announces it on an [`EventSink`]
pub struct BlobAlertPublisher<B, E> {
    blobs: B,
    events: E,
}

impl<B, E> BlobAlertPublisher<B, E>
where
    B: BlobStore,
    E: EventSink,
{
    pub fn new(blobs: B, events: E) -> Self {
        Self { blobs, events }
    }

    pub fn blobs(&self) -> &B {
        &self.blobs
    }

    pub fn events(&self) -> &E {
        &self.events
    }

    /// Blob path of an alert; the date is the alert's analysis timestamp
    pub fn blob_path(detector_id: &str, alert: &CanonicalAlert) -> String {
        format!(
            "alerts/{}/{}/{}.json",
            detector_id,
            alert.analysis_timestamp.format("%Y-%m-%d"),
            alert.id
        )
    }
}

#[async_trait]
impl<B, E> AlertPublisher for BlobAlertPublisher<B, E>
where
    B: BlobStore,
    E: EventSink,
{
    async fn publish(
        &self,
        detector_id: &str,
        alerts: &[CanonicalAlert],
    ) -> Result<(), StoreError> {
        if alerts.is_empty() {
            debug!(detector_id = %detector_id, "No alerts to publish");
            return Ok(());
        }

        for alert in alerts {
            let path = Self::blob_path(detector_id, alert);
            let body = serde_json::to_vec_pretty(alert)?;
            self.blobs.put(&path, body).await?;

            self.events
                .emit(AlertEvent {
                    detector_id: detector_id.to_string(),
                    alert_id: alert.id.clone(),
                    path,
                    correlation_hash: alert.correlation_hash.clone(),
                    resource_id: alert.resource_id.to_string(),
                })
                .await?;
        }
        Ok(())
    }
}

/// Event sink that writes each event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn emit(&self, event: AlertEvent) -> Result<(), StoreError> {
        info!(
            event = "alert_published",
            detector_id = %event.detector_id,
            alert_id = %event.alert_id,
            path = %event.path,
            correlation_hash = %event.correlation_hash,
            resource_id = %event.resource_id,
            "Alert published"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceIdentifier, ResourceType};
    use crate::storage::memory::{MemoryBlobStore, MemoryEventSink};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    fn alert(id: &str) -> CanonicalAlert {
        CanonicalAlert {
            id: id.to_string(),
            title: "High CPU on vm1".to_string(),
            resource_id: ResourceIdentifier::resource(ResourceType::VirtualMachine, "s", "g", "vm1")
                .unwrap(),
            correlation_hash: "c0ffee".to_string(),
            detector_id: "cpu".to_string(),
            detector_name: "High CPU".to_string(),
            analysis_timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 23, 55, 0).unwrap(),
            analysis_window_minutes: 5,
            properties: Vec::new(),
            raw_properties: BTreeMap::new(),
            query_run_info: None,
        }
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let publisher = BlobAlertPublisher::new(MemoryBlobStore::new(), MemoryEventSink::new());

        publisher.publish("cpu", &[]).await.unwrap();

        assert_eq!(publisher.blobs().write_count(), 0);
        assert_eq!(publisher.events().event_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_writes_and_emits_per_alert() {
        let publisher = BlobAlertPublisher::new(MemoryBlobStore::new(), MemoryEventSink::new());

        publisher
            .publish("cpu", &[alert("a1"), alert("a2")])
            .await
            .unwrap();

        assert_eq!(publisher.blobs().write_count(), 2);
        let stored = publisher.blobs().get("alerts/cpu/2024-03-09/a1.json").unwrap();
        let back: CanonicalAlert = serde_json::from_slice(&stored).unwrap();
        assert_eq!(back, alert("a1"));

        let events = publisher.events().events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].alert_id, "a2");
        assert_eq!(events[1].path, "alerts/cpu/2024-03-09/a2.json");
        assert_eq!(events[0].correlation_hash, "c0ffee");
    }
}
