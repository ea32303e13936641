use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Provider objects are deserialized only as far as reconciliation reads
/// them; everything else in the payload stays opaque.

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: String,
    pub status: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<i64>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    pub price: Price,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    pub id: String,
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    pub customer_details: Option<CustomerDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDetails {
    pub email: Option<String>,
}

impl CheckoutSession {
    /// Checkout carries the org either in metadata or as the reference id.
    pub fn org_id(&self) -> Option<&str> {
        self.metadata
            .get("org_id")
            .and_then(|v| v.as_str())
            .or(self.client_reference_id.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub customer: Option<String>,
    pub subscription: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerObject {
    pub id: String,
    pub email: Option<String>,
}

/// The envelope is `{ id, type, data: { object: {...} } }`; handlers only
/// ever look at the inner object.
pub fn event_object(payload: &Value) -> Result<&Value> {
    payload
        .get("data")
        .and_then(|d| d.get("object"))
        .ok_or_else(|| anyhow!("event payload has no data.object"))
}

pub fn datetime_from_epoch(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

// ---- metered usage reporting ----

#[derive(Debug, Clone, Serialize)]
pub struct MeterEvent {
    pub event_name: String,
    pub payload: MeterEventPayload,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterEventPayload {
    pub stripe_customer_id: String,
    pub value: i64,
}

/// POST one meter event to the billing provider. The base URL is
/// configurable so tests can point at a local stub.
pub async fn report_meter_event(
    client: &reqwest::Client,
    api_base: &str,
    api_key: &str,
    event: &MeterEvent,
) -> Result<()> {
    let url = format!("{}/v2/billing/meter_events", api_base.trim_end_matches('/'));

    let resp = client
        .post(&url)
        .bearer_auth(api_key)
        .json(event)
        .timeout(Duration::from_secs(15))
        .send()
        .await?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(anyhow!("meter event API returned {status}: {body}"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subscription_object_reads_first_price() {
        let obj: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "active",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "items": { "data": [ { "price": { "id": "price_pro" } } ] }
        }))
        .unwrap();

        assert_eq!(obj.price_id(), Some("price_pro"));
        assert!(!obj.cancel_at_period_end);
    }

    #[test]
    fn subscription_without_items_still_parses() {
        let obj: SubscriptionObject = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "canceled"
        }))
        .unwrap();

        assert_eq!(obj.price_id(), None);
        assert_eq!(obj.current_period_start, None);
    }

    #[test]
    fn checkout_session_org_prefers_metadata() {
        let session: CheckoutSession = serde_json::from_value(json!({
            "customer": "cus_1",
            "subscription": "sub_1",
            "client_reference_id": "11111111-1111-1111-1111-111111111111",
            "metadata": { "org_id": "22222222-2222-2222-2222-222222222222" }
        }))
        .unwrap();

        assert_eq!(
            session.org_id(),
            Some("22222222-2222-2222-2222-222222222222")
        );
    }

    #[test]
    fn event_object_requires_data_object() {
        let payload = json!({ "id": "evt_1", "type": "invoice.paid" });
        assert!(event_object(&payload).is_err());

        let payload = json!({ "data": { "object": { "id": "in_1" } } });
        assert_eq!(event_object(&payload).unwrap()["id"], "in_1");
    }

    #[test]
    fn meter_event_serializes_provider_shape() {
        let event = MeterEvent {
            event_name: "api_calls".to_string(),
            payload: MeterEventPayload {
                stripe_customer_id: "cus_1".to_string(),
                value: 1234,
            },
            timestamp: 1_700_000_000,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_name"], "api_calls");
        assert_eq!(json["payload"]["stripe_customer_id"], "cus_1");
        assert_eq!(json["payload"]["value"], 1234);
        assert_eq!(json["timestamp"], 1_700_000_000);
    }
}
