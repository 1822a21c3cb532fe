//! Remote control plane over MQTT.
//!
//! Commands arrive on `vmc/<machine_id>/<verb>` as JSON. Writes are
//! persisted to the catalogue first and then pushed down the serial link as
//! a single VMC command (per-cell, tray broadcast as `1000+tray`, or global
//! broadcast as selection 0). Every command gets a JSON reply on its status
//! topic; malformed or out-of-range commands get `success: false` and change
//! nothing.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{select, time::sleep};
use vmcproto::command::{self, Command, Target};

use crate::{
    backoff::Backoff,
    catalogue::{Catalogue, CatalogueEntry, EntryPatch, SELECTION_MAX, SELECTION_MIN, TRAY_MAX},
    config::Config,
    journal::SalesJournal,
    link::LinkHandle,
    shutdown::ShutdownHandle,
};

const VERBS: [&str; 7] = [
    "set_price",
    "set_inventory",
    "set_capacity",
    "get_prices",
    "get_inventory_by_tray",
    "get_sales",
    "ping",
];

/// An incoming command body. Exactly one of `selection`, `tray`, `all`
/// targets the write; wide integer types so range errors are reported
/// instead of silently truncated.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandMsg {
    selection: Option<u64>,
    tray: Option<u64>,
    all: Option<bool>,
    price: Option<u64>,
    inventory: Option<u64>,
    capacity: Option<u64>,
}

impl CommandMsg {
    fn parse(payload: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(payload).map_err(|e| format!("invalid command payload: {e}"))
    }

    fn target(&self) -> Result<Target, String> {
        match (self.selection, self.tray, self.all.unwrap_or(false)) {
            (Some(s), None, false) => {
                if (SELECTION_MIN as u64..=SELECTION_MAX as u64).contains(&s) {
                    Ok(Target::Selection(s as u16))
                } else {
                    Err(format!(
                        "selection {s} out of range {SELECTION_MIN}..={SELECTION_MAX}"
                    ))
                }
            }
            (None, Some(t), false) => {
                if t <= TRAY_MAX as u64 {
                    Ok(Target::Tray(t as u8))
                } else {
                    Err(format!("tray {t} out of range 0..={TRAY_MAX}"))
                }
            }
            (None, None, true) => Ok(Target::All),
            _ => Err("target must be exactly one of `selection`, `tray` or `all: true`".to_owned()),
        }
    }
}

pub struct ControlPlane {
    machine_id: String,
    broker_host: String,
    broker_port: u16,
    catalogue: Catalogue,
    journal: SalesJournal,
    link: LinkHandle,
}

impl ControlPlane {
    pub fn new(cfg: &Config, catalogue: Catalogue, journal: SalesJournal, link: LinkHandle) -> Self {
        Self {
            machine_id: cfg.machine_id.clone(),
            broker_host: cfg.broker_ip.clone(),
            broker_port: cfg.broker_port,
            catalogue,
            journal,
            link,
        }
    }

    pub async fn run(self, mut shutdown: ShutdownHandle) {
        let mut options = MqttOptions::new(
            format!("vendlink-{}", self.machine_id),
            self.broker_host.clone(),
            self.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let mut backoff = Backoff::reconnect();
        let prefix = format!("vmc/{}/", self.machine_id);

        loop {
            select! {
                _ = shutdown.wait_for_shutdown() => {
                    let _ = client.disconnect().await;
                    break;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(host = %self.broker_host, port = self.broker_port, "connected to MQTT broker");
                        backoff.reset();
                        for verb in VERBS {
                            if let Err(e) = client.subscribe(self.topic(verb), QoS::AtLeastOnce).await {
                                warn!("could not subscribe to {verb}: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(verb) = publish.topic.strip_prefix(&prefix) else {
                            warn!(topic = %publish.topic, "publish outside our topic space");
                            continue;
                        };
                        debug!(verb, "control command received");
                        if let Some((status_topic, body)) = self.handle(verb, &publish.payload).await {
                            if let Err(e) = client
                                .publish(self.topic(status_topic), QoS::AtLeastOnce, false, body.to_string())
                                .await
                            {
                                warn!("could not publish {status_topic}: {e}");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!("MQTT connection error: {e}; retrying in {delay:?}");
                        select! {
                            _ = shutdown.wait_for_shutdown() => break,
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        }
        trace!("control plane stopped");
    }

    fn topic(&self, suffix: &str) -> String {
        format!("vmc/{}/{suffix}", self.machine_id)
    }

    /// Dispatch one command; returns the status-topic suffix and reply body.
    async fn handle(&self, verb: &str, payload: &[u8]) -> Option<(&'static str, Value)> {
        match verb {
            "set_price" => Some(("price_update_status", self.set_price(payload).await)),
            "set_inventory" => Some(("inventory_update_status", self.set_inventory(payload).await)),
            "set_capacity" => Some(("capacity_update_status", self.set_capacity(payload).await)),
            "get_prices" => Some(("prices", self.get_prices().await)),
            "get_inventory_by_tray" => Some((
                "inventory_by_tray_status",
                self.get_inventory_by_tray(payload).await,
            )),
            "get_sales" => Some(("sales_update_status", self.get_sales().await)),
            "ping" => Some(("pong", self.pong(payload))),
            other => {
                warn!(verb = other, "unknown control verb");
                None
            }
        }
    }

    async fn set_price(&self, payload: &[u8]) -> Value {
        let msg = match CommandMsg::parse(payload) {
            Ok(msg) => msg,
            Err(e) => return self.err_response(e),
        };
        let target = match msg.target() {
            Ok(target) => target,
            Err(e) => return self.err_response(e),
        };
        let Some(price) = msg.price else {
            return self.err_response("missing field `price`");
        };
        let Ok(price) = u32::try_from(price) else {
            return self.err_response(format!("price {price} does not fit in 32 bits"));
        };
        let updated = match self.apply(target, EntryPatch::price(price)).await {
            Ok(updated) => updated,
            Err(e) => return self.err_response(e),
        };
        self.link
            .enqueue(Command::SetPrice, command::set_price(target, price));
        let results: Vec<Value> = updated
            .iter()
            .map(|e| json!({ "selection": e.selection, "price": e.price_minor }))
            .collect();
        self.ok_response(json!(results))
    }

    async fn set_inventory(&self, payload: &[u8]) -> Value {
        let msg = match CommandMsg::parse(payload) {
            Ok(msg) => msg,
            Err(e) => return self.err_response(e),
        };
        let target = match msg.target() {
            Ok(target) => target,
            Err(e) => return self.err_response(e),
        };
        let Some(inventory) = msg.inventory else {
            return self.err_response("missing field `inventory`");
        };
        let Ok(inventory) = u8::try_from(inventory) else {
            return self.err_response(format!("inventory {inventory} out of range 0..=255"));
        };
        let updated = match self.apply(target, EntryPatch::inventory(inventory)).await {
            Ok(updated) => updated,
            Err(e) => return self.err_response(e),
        };
        self.link.enqueue(
            Command::SetInventory,
            command::set_inventory(target, inventory),
        );
        let results: Vec<Value> = updated
            .iter()
            .map(|e| json!({ "selection": e.selection, "inventory": e.inventory }))
            .collect();
        self.ok_response(json!(results))
    }

    async fn set_capacity(&self, payload: &[u8]) -> Value {
        let msg = match CommandMsg::parse(payload) {
            Ok(msg) => msg,
            Err(e) => return self.err_response(e),
        };
        let target = match msg.target() {
            Ok(target) => target,
            Err(e) => return self.err_response(e),
        };
        let Some(capacity) = msg.capacity else {
            return self.err_response("missing field `capacity`");
        };
        let Ok(capacity) = u8::try_from(capacity) else {
            return self.err_response(format!("capacity {capacity} out of range 0..=255"));
        };
        let updated = match self.apply(target, EntryPatch::capacity(capacity)).await {
            Ok(updated) => updated,
            Err(e) => return self.err_response(e),
        };
        self.link.enqueue(
            Command::SetCapacity,
            command::set_capacity(target, capacity),
        );
        let results: Vec<Value> = updated
            .iter()
            .map(|e| json!({ "selection": e.selection, "capacity": e.capacity }))
            .collect();
        self.ok_response(json!(results))
    }

    async fn apply(&self, target: Target, patch: EntryPatch) -> Result<Vec<CatalogueEntry>> {
        match target {
            Target::Selection(s) => Ok(vec![self.catalogue.upsert(s, patch).await?]),
            Target::Tray(t) => self.catalogue.upsert_tray(t, patch).await,
            Target::All => self.catalogue.upsert_all(patch).await,
        }
    }

    async fn get_prices(&self) -> Value {
        let entries = self.catalogue.list().await;
        let results = serde_json::to_value(entries).unwrap_or_else(|_| json!([]));
        self.ok_response(results)
    }

    async fn get_inventory_by_tray(&self, payload: &[u8]) -> Value {
        let msg = if payload.is_empty() {
            CommandMsg::default()
        } else {
            match CommandMsg::parse(payload) {
                Ok(msg) => msg,
                Err(e) => return self.err_response(e),
            }
        };
        let trays: Vec<u8> = match msg.tray {
            Some(t) if t <= TRAY_MAX as u64 => vec![t as u8],
            Some(t) => return self.err_response(format!("tray {t} out of range 0..={TRAY_MAX}")),
            None => (0..=TRAY_MAX).collect(),
        };
        let entries = self.catalogue.list().await;
        let results: Vec<Value> = trays
            .iter()
            .map(|&tray| {
                let selections: Vec<Value> = entries
                    .iter()
                    .filter(|e| e.tray == tray)
                    .map(|e| json!({ "selection": e.selection, "inventory": e.inventory }))
                    .collect();
                json!({ "tray": tray, "selections": selections })
            })
            .collect();
        self.ok_response(json!(results))
    }

    async fn get_sales(&self) -> Value {
        match self.journal.list().await {
            Ok(records) => {
                let results = serde_json::to_value(records).unwrap_or_else(|_| json!([]));
                self.ok_response(results)
            }
            Err(e) => self.err_response(e),
        }
    }

    /// Echo the payload's fields back with our identity stamped on.
    fn pong(&self, payload: &[u8]) -> Value {
        let mut body = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        body.insert("status".to_owned(), json!("ok"));
        body.insert("timestamp".to_owned(), json!(Utc::now().to_rfc3339()));
        body.insert("machine_id".to_owned(), json!(self.machine_id));
        Value::Object(body)
    }

    fn ok_response(&self, results: Value) -> Value {
        json!({
            "success": true,
            "machine_id": self.machine_id,
            "timestamp": Utc::now().to_rfc3339(),
            "results": results,
        })
    }

    fn err_response(&self, error: impl ToString) -> Value {
        json!({
            "success": false,
            "machine_id": self.machine_id,
            "timestamp": Utc::now().to_rfc3339(),
            "error": error.to_string(),
            "results": [],
        })
    }
}

#[cfg(test)]
mod test {
    use tracing_test::traced_test;

    use super::*;

    struct Fixture {
        control: ControlPlane,
        catalogue: Catalogue,
        journal: SalesJournal,
        link: LinkHandle,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let catalogue = Catalogue::open(dir.path().join("catalogue.json"))
            .await
            .unwrap();
        let journal = SalesJournal::open(dir.path().join("sales.jsonl"))
            .await
            .unwrap();
        let link = LinkHandle::detached();
        let control = ControlPlane {
            machine_id: "VM001".to_owned(),
            broker_host: "127.0.0.1".to_owned(),
            broker_port: 1883,
            catalogue: catalogue.clone(),
            journal: journal.clone(),
            link: link.clone(),
        };
        Fixture {
            control,
            catalogue,
            journal,
            link,
            _dir: dir,
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn tray_price_broadcast() {
        let f = fixture().await;
        let (topic, body) = f
            .control
            .handle("set_price", br#"{"tray":3,"price":200}"#)
            .await
            .unwrap();

        assert_eq!(topic, "price_update_status");
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["results"].as_array().unwrap().len(), 10);
        for s in 31..=40u16 {
            assert_eq!(f.catalogue.get(s).await.unwrap().price_minor, 200);
        }
        // one broadcast command: selection 1000+3, price 200
        let queued = f.link.pop().unwrap();
        assert_eq!(queued.cmd, Command::SetPrice);
        assert_eq!(queued.payload, vec![0x03, 0xEB, 0x00, 0x00, 0x00, 0xC8]);
        assert!(f.link.pop().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn all_price_write_is_observed_by_get_prices() {
        let f = fixture().await;
        let (_, body) = f
            .control
            .handle("set_price", br#"{"all":true,"price":120}"#)
            .await
            .unwrap();
        assert_eq!(body["success"], json!(true));

        let queued = f.link.pop().unwrap();
        assert_eq!(queued.payload[..2], [0x00, 0x00]); // broadcast target

        let (topic, body) = f.control.handle("get_prices", b"{}").await.unwrap();
        assert_eq!(topic, "prices");
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 100);
        assert!(results.iter().all(|e| e["price_minor"] == json!(120)));
    }

    #[tokio::test]
    #[traced_test]
    async fn set_inventory_single_cell() {
        let f = fixture().await;
        let (topic, body) = f
            .control
            .handle("set_inventory", br#"{"selection":7,"inventory":4}"#)
            .await
            .unwrap();
        assert_eq!(topic, "inventory_update_status");
        assert_eq!(body["success"], json!(true));
        assert_eq!(f.catalogue.get(7).await.unwrap().inventory, 4);
        let queued = f.link.pop().unwrap();
        assert_eq!(queued.cmd, Command::SetInventory);
        assert_eq!(queued.payload, vec![0x00, 0x07, 0x04]);
    }

    #[tokio::test]
    #[traced_test]
    async fn set_capacity_tray() {
        let f = fixture().await;
        let (topic, body) = f
            .control
            .handle("set_capacity", br#"{"tray":0,"capacity":8}"#)
            .await
            .unwrap();
        assert_eq!(topic, "capacity_update_status");
        assert_eq!(body["success"], json!(true));
        assert_eq!(f.catalogue.get(1).await.unwrap().capacity, 8);
        assert_eq!(f.catalogue.get(10).await.unwrap().capacity, 8);
        let queued = f.link.pop().unwrap();
        assert_eq!(queued.cmd, Command::SetCapacity);
        assert_eq!(queued.payload, vec![0x03, 0xE8, 0x08]);
    }

    #[tokio::test]
    #[traced_test]
    async fn invalid_commands_change_nothing() {
        let f = fixture().await;
        let cases: [(&str, &[u8]); 10] = [
            ("set_price", br#"{"tray":3}"#),                          // missing price
            ("set_price", br#"{"tray":12,"price":10}"#),              // tray range
            ("set_price", br#"{"selection":0,"price":10}"#),          // selection range
            ("set_price", br#"{"selection":101,"price":10}"#),        // selection range
            ("set_price", br#"{"selection":1,"tray":1,"price":10}"#), // ambiguous target
            ("set_price", br#"{"price":10}"#),                        // no target
            ("set_price", br#"{"all":true,"price":4294967296}"#),     // price range
            ("set_price", b"not json"),                               // malformed
            ("set_inventory", br#"{"selection":1,"inventory":300}"#), // inventory range
            ("set_capacity", br#"{"selection":1,"capacity":256}"#),   // capacity range
        ];
        for (verb, payload) in cases {
            let (_, body) = f.control.handle(verb, payload).await.unwrap();
            assert_eq!(body["success"], json!(false), "payload: {payload:?}");
            assert!(!body["error"].as_str().unwrap().is_empty());
        }
        assert!(f.catalogue.list().await.is_empty());
        assert!(f.link.pop().is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn inventory_by_tray_snapshot() {
        let f = fixture().await;
        f.catalogue
            .upsert(31, EntryPatch::inventory(2))
            .await
            .unwrap();
        f.catalogue
            .upsert(32, EntryPatch::inventory(5))
            .await
            .unwrap();

        let (topic, body) = f
            .control
            .handle("get_inventory_by_tray", br#"{"tray":3}"#)
            .await
            .unwrap();
        assert_eq!(topic, "inventory_by_tray_status");
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["tray"], json!(3));
        let selections = results[0]["selections"].as_array().unwrap();
        assert_eq!(selections.len(), 2);

        // no tray selects every tray
        let (_, body) = f.control.handle("get_inventory_by_tray", b"").await.unwrap();
        assert_eq!(body["results"].as_array().unwrap().len(), 10);
    }

    #[tokio::test]
    #[traced_test]
    async fn sales_export() {
        let f = fixture().await;
        f.journal
            .append(&crate::journal::SaleRecord::now(
                "123456",
                7,
                crate::journal::SaleStatus::Success,
                None,
                "Cola",
                150,
            ))
            .await
            .unwrap();

        let (topic, body) = f.control.handle("get_sales", b"{}").await.unwrap();
        assert_eq!(topic, "sales_update_status");
        assert_eq!(body["success"], json!(true));
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["txn_id"], json!("123456"));
        assert_eq!(results[0]["status"], json!("success"));
    }

    #[tokio::test]
    #[traced_test]
    async fn ping_echoes_and_stamps() {
        let f = fixture().await;
        let (topic, body) = f
            .control
            .handle("ping", br#"{"nonce":42}"#)
            .await
            .unwrap();
        assert_eq!(topic, "pong");
        assert_eq!(body["nonce"], json!(42));
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["machine_id"], json!("VM001"));
        assert!(body["timestamp"].as_str().is_some());
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_verb_gets_no_reply() {
        let f = fixture().await;
        assert!(f.control.handle("reboot", b"{}").await.is_none());
    }
}
