//! Message bodies of the eSocket.POS XML dialect.

const DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const XMLNS: &str = "http://www.mosaicsoftware.com/Postilion/eSocket.POS/";

fn interface(inner: &str) -> String {
    format!(
        "{DECLARATION}\n<Esp:Interface Version=\"1.0\" xmlns:Esp=\"{XMLNS}\">{inner}</Esp:Interface>"
    )
}

/// Terminal registration, subscribing to the card-presentation events.
pub fn init(terminal_id: &str) -> String {
    interface(&format!(
        "<Esp:Admin TerminalId=\"{terminal_id}\" Action=\"INIT\">\
         <Esp:Register Type=\"EVENT\" EventId=\"PROMPT_INSERT_CARD\" />\
         <Esp:Register Type=\"EVENT\" EventId=\"CARD_INSERTED\" />\
         </Esp:Admin>"
    ))
}

pub fn close(terminal_id: &str) -> String {
    interface(&format!(
        "<Esp:Admin TerminalId=\"{terminal_id}\" Action=\"CLOSE\" />"
    ))
}

pub fn purchase(terminal_id: &str, txn_id: &str, amount_minor: u32, currency: &str) -> String {
    interface(&format!(
        "<Esp:Transaction TerminalId=\"{terminal_id}\" TransactionId=\"{txn_id}\" \
         Type=\"PURCHASE\" TransactionAmount=\"{amount_minor}\" CurrencyCode=\"{currency}\" />"
    ))
}

pub fn reversal(terminal_id: &str, txn_id: &str, original_txn_id: &str, reason: &str) -> String {
    interface(&format!(
        "<Esp:Transaction TerminalId=\"{terminal_id}\" TransactionId=\"{txn_id}\" \
         Type=\"REFUND\" OriginalTransactionId=\"{original_txn_id}\" ReasonCode=\"{reason}\" />"
    ))
}

/// The gateway's entire acceptance signal.
pub fn is_approved(raw: &str) -> bool {
    raw.contains(r#"ActionCode="APPROVE""#)
}
