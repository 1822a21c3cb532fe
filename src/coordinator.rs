//! Transaction coordinator.
//!
//! Owns the one live sale at a time and walks it from keypad selection
//! through payment, dispense and (when the machine jams) reversal. Runs as a
//! single event loop over decoded VMC traffic; while a payment is in flight
//! the loop keeps listening so a keypad cancel can abandon it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::{
    select,
    time::{sleep_until, Instant},
};
use vmcproto::command::{self, Command, DirectDrive, DispenseStatus, SelectionInfo, Target};

use crate::{
    catalogue::{Catalogue, CatalogueEntry, EntryPatch},
    journal::{SaleRecord, SaleStatus, SalesJournal},
    link::{LinkEvent, LinkHandle},
    payment::PaymentTerminal,
    shutdown::ShutdownHandle,
};

/// How long to wait for a final dispense status before assuming the product
/// never moved and refunding.
const DISPENSE_TIMEOUT: Duration = Duration::from_secs(30);

enum PayEnd {
    Approved,
    Declined(String),
    /// keypad cancel arrived while the gateway was thinking
    Cancelled,
    /// link lost or shutdown; the purchase task was dropped mid-flight
    Interrupted,
}

enum DispenseEnd {
    Success,
    Failed(u8, &'static str),
}

pub struct Coordinator<P: PaymentTerminal> {
    link: LinkHandle,
    events: flume::Receiver<LinkEvent>,
    catalogue: Catalogue,
    journal: SalesJournal,
    payment: P,
    /// sequence number of the last accepted SELECT_CANCEL; the VMC
    /// retransmits with the same number, and repeats must not change state
    last_keypad_seq: Option<u8>,
}

impl<P: PaymentTerminal> Coordinator<P> {
    pub fn new(
        link: LinkHandle,
        events: flume::Receiver<LinkEvent>,
        catalogue: Catalogue,
        journal: SalesJournal,
        payment: P,
    ) -> Self {
        Self {
            link,
            events,
            catalogue,
            journal,
            payment,
            last_keypad_seq: None,
        }
    }

    pub async fn run(mut self, mut shutdown: ShutdownHandle) {
        info!("transaction coordinator running");
        loop {
            let event = select! {
                _ = shutdown.wait_for_shutdown() => break,
                event = self.events.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };
            match event {
                LinkEvent::Select { selection, seq } => {
                    if self.repeat_keypad(seq) {
                        continue;
                    }
                    if let Err(e) = self.run_sale(selection, &mut shutdown).await {
                        error!("sale for selection {selection} failed: {e:#}");
                    }
                }
                LinkEvent::Cancel { seq } => {
                    // nothing in progress; remember the seq so a retransmit
                    // of this cancel stays a no-op
                    let _ = self.repeat_keypad(seq);
                }
                LinkEvent::SelectionInfo(info) => self.absorb_selection_info(info).await,
                LinkEvent::SelectionStatus { data, .. } => {
                    debug!(?data, "selection status report")
                }
                LinkEvent::Dispense { report, .. } => {
                    debug!(?report, "dispense status outside a transaction")
                }
                LinkEvent::Up | LinkEvent::Down => {}
            }
        }
        if let Err(e) = self.payment.close().await {
            warn!("closing payment session: {e:#}");
        }
        trace!("transaction coordinator stopped");
    }

    /// True when `seq` is a retransmission of the last keypad packet.
    fn repeat_keypad(&mut self, seq: u8) -> bool {
        if self.last_keypad_seq == Some(seq) {
            debug!(seq, "retransmitted keypad packet ignored");
            return true;
        }
        self.last_keypad_seq = Some(seq);
        false
    }

    async fn run_sale(&mut self, selection: u16, shutdown: &mut ShutdownHandle) -> Result<()> {
        info!(selection, "keypad selection");
        // always read the store fresh; the control plane may have repriced
        // the slot since the last sale
        let entry = self.catalogue.get(selection).await;
        let Some(entry) = entry.filter(|e| e.price_minor > 0) else {
            warn!(selection, "not in catalogue or unpriced, cancelling selection");
            self.finish(true);
            return Ok(());
        };

        let txn_id = clock_txn_id();
        let amount = entry.price_minor;
        info!(txn = %txn_id, amount, "requesting card payment");

        match self.collect_payment(&txn_id, amount, shutdown).await {
            PayEnd::Approved => {}
            PayEnd::Declined(reason) => {
                warn!(txn = %txn_id, "payment declined: {reason}");
                self.journal_sale(&entry, &txn_id, SaleStatus::Declined, Some(reason))
                    .await;
                self.finish(true);
                return Ok(());
            }
            PayEnd::Cancelled => {
                info!(txn = %txn_id, "customer cancelled during payment");
                self.payment.abort();
                self.journal_sale(
                    &entry,
                    &txn_id,
                    SaleStatus::Declined,
                    Some("cancelled by customer".to_owned()),
                )
                .await;
                self.finish(false);
                return Ok(());
            }
            PayEnd::Interrupted => {
                warn!(txn = %txn_id, "payment interrupted");
                self.payment.abort();
                self.journal_sale(
                    &entry,
                    &txn_id,
                    SaleStatus::Declined,
                    Some("interrupted before completion".to_owned()),
                )
                .await;
                self.finish(false);
                return Ok(());
            }
        }

        self.journal_sale(&entry, &txn_id, SaleStatus::Approved, None)
            .await;
        self.link.enqueue(
            Command::DirectDrive,
            DirectDrive {
                drop_sensor: true,
                elevator: true,
                selection,
            }
            .encode()
            .to_vec(),
        );
        info!(selection, txn = %txn_id, "dispense commanded");

        match self.await_dispense(shutdown).await {
            DispenseEnd::Success => {
                info!(selection, "dispense successful");
                self.journal_sale(&entry, &txn_id, SaleStatus::Success, None)
                    .await;
                self.finish(false);
                match self.catalogue.decrement_inventory(selection).await {
                    Ok(remaining) => {
                        if self.link.is_up() {
                            self.link.enqueue(
                                Command::SetInventory,
                                command::set_inventory(Target::Selection(selection), remaining),
                            );
                        } else {
                            warn!("link down, skipping inventory push to VMC");
                        }
                    }
                    Err(e) => warn!("inventory decrement failed: {e:#}"),
                }
            }
            DispenseEnd::Failed(status_code, description) => {
                warn!(selection, "dispense failed: {description}");
                self.journal_sale(
                    &entry,
                    &txn_id,
                    SaleStatus::Error,
                    Some(description.to_owned()),
                )
                .await;
                self.reverse(&entry, &txn_id, status_code).await;
                self.finish(false);
            }
        }
        Ok(())
    }

    /// Race the purchase against the event stream so a keypad cancel can
    /// drop it; the payment task is cancelled at its next suspension point.
    async fn collect_payment(
        &mut self,
        txn_id: &str,
        amount: u32,
        shutdown: &mut ShutdownHandle,
    ) -> PayEnd {
        let Self {
            payment,
            events,
            last_keypad_seq,
            ..
        } = self;
        let purchase = payment.purchase(txn_id, amount);
        tokio::pin!(purchase);
        loop {
            select! {
                _ = shutdown.wait_for_shutdown() => return PayEnd::Interrupted,
                result = &mut purchase => {
                    return match result {
                        Ok(outcome) if outcome.approved => PayEnd::Approved,
                        Ok(_) => PayEnd::Declined("payment declined".to_owned()),
                        Err(e) => PayEnd::Declined(format!("payment failed: {e:#}")),
                    };
                }
                event = events.recv_async() => match event {
                    Ok(LinkEvent::Cancel { seq }) => {
                        if *last_keypad_seq == Some(seq) {
                            continue;
                        }
                        *last_keypad_seq = Some(seq);
                        return PayEnd::Cancelled;
                    }
                    Ok(LinkEvent::Select { selection, seq }) => {
                        if *last_keypad_seq != Some(seq) {
                            *last_keypad_seq = Some(seq);
                            debug!(selection, "selection ignored, transaction in progress");
                        }
                    }
                    Ok(LinkEvent::Down) => return PayEnd::Interrupted,
                    Ok(_) => {}
                    Err(_) => return PayEnd::Interrupted,
                }
            }
        }
    }

    async fn await_dispense(&mut self, shutdown: &mut ShutdownHandle) -> DispenseEnd {
        let Self {
            events,
            last_keypad_seq,
            ..
        } = self;
        let deadline = Instant::now() + DISPENSE_TIMEOUT;
        loop {
            select! {
                _ = shutdown.wait_for_shutdown() => {
                    warn!("shutdown while dispensing");
                    return DispenseEnd::Failed(
                        DispenseStatus::Terminated.into(),
                        "interrupted by shutdown",
                    );
                }
                _ = sleep_until(deadline) => {
                    return DispenseEnd::Failed(
                        DispenseStatus::Terminated.into(),
                        "no dispense status from VMC",
                    );
                }
                event = events.recv_async() => match event {
                    Ok(LinkEvent::Dispense { report, .. }) => {
                        if report.status.is_success() {
                            return DispenseEnd::Success;
                        }
                        match report.status {
                            DispenseStatus::InProgress => debug!("dispensing in progress"),
                            status => {
                                return DispenseEnd::Failed(status.into(), status.describe())
                            }
                        }
                    }
                    Ok(LinkEvent::Cancel { seq }) | Ok(LinkEvent::Select { seq, .. }) => {
                        // too late to cancel, but keep the dedupe current
                        if *last_keypad_seq != Some(seq) {
                            *last_keypad_seq = Some(seq);
                        }
                    }
                    Ok(LinkEvent::Down) | Err(_) => {
                        return DispenseEnd::Failed(
                            DispenseStatus::Terminated.into(),
                            "serial link lost while dispensing",
                        );
                    }
                    Ok(_) => {}
                }
            }
        }
    }

    async fn reverse(&mut self, entry: &CatalogueEntry, original_txn_id: &str, status_code: u8) {
        let reversal_id = distinct_txn_id(original_txn_id);
        let reason = format!("Product jam error {status_code:02X}");
        info!(txn = %reversal_id, original = %original_txn_id, "requesting payment reversal");
        match self
            .payment
            .reversal(&reversal_id, original_txn_id, &reason)
            .await
        {
            Ok(outcome) if outcome.approved => {
                info!(original = %original_txn_id, "payment reversed");
                self.journal_sale(entry, original_txn_id, SaleStatus::Reversed, Some(reason))
                    .await;
            }
            // the dispense failure is already on record as `error`
            Ok(_) => error!(original = %original_txn_id, "reversal declined by gateway"),
            Err(e) => error!(original = %original_txn_id, "reversal failed: {e:#}"),
        }
    }

    /// Common exit-to-idle cleanup: throw away whatever is still queued for
    /// the VMC, and when the sale ends before dispensing, tell the VMC to
    /// clear the selection. With the queue empty the next POLL gets a bare
    /// ACK.
    fn finish(&self, cancel_selection: bool) {
        self.link.drain();
        if cancel_selection && self.link.is_up() {
            self.link
                .enqueue(Command::SelectCancel, command::select_cancel(0));
        }
    }

    /// Merge a VMC-side catalogue row (SELECTION_INFO) into the store.
    async fn absorb_selection_info(&self, info: SelectionInfo) {
        let patch = EntryPatch {
            price_minor: Some(info.price_minor),
            inventory: Some(info.inventory),
            capacity: Some(info.capacity),
            product_id: Some(info.product_id),
            product_name: None,
        };
        match self.catalogue.upsert(info.selection, patch).await {
            Ok(_) => debug!(selection = info.selection, "catalogue row synced from VMC"),
            Err(e) => warn!(selection = info.selection, "selection info rejected: {e:#}"),
        }
    }

    async fn journal_sale(
        &self,
        entry: &CatalogueEntry,
        txn_id: &str,
        status: SaleStatus,
        reason: Option<String>,
    ) {
        let record = SaleRecord::now(
            txn_id,
            entry.selection,
            status,
            reason,
            &entry.product_name,
            entry.price_minor,
        );
        if let Err(e) = self.journal.append(&record).await {
            error!("could not journal sale: {e:#}");
        }
    }
}

/// Six decimal digits, never starting with zero.
fn clock_txn_id() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    (seconds % 900_000 + 100_000).to_string()
}

/// A fresh id that cannot collide with `other`, even within the same second.
fn distinct_txn_id(other: &str) -> String {
    let id = clock_txn_id();
    if id != other {
        return id;
    }
    let bumped = id.parse::<u64>().unwrap_or(100_000) + 1;
    if bumped > 999_999 {
        "100000".to_owned()
    } else {
        bumped.to_string()
    }
}
