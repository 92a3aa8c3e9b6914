//! Разбор XML-ответов шлюза.
//!
//! Шлюз присылает плоские документы без вложенности и без CDATA, поэтому
//! вместо полноценного XML-парсера здесь узкий сканер тегов первого уровня.

use rust_decimal::Decimal;

/// Документ деталей платежа имеет корневой элемент `<Message>`.
pub fn is_message(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    // Пропускаем XML-декларацию, если она есть
    let body = if trimmed.starts_with("<?") {
        match trimmed.find("?>") {
            Some(i) => trimmed[i + 2..].trim_start(),
            None => trimmed,
        }
    } else {
        trimmed
    };
    match body.strip_prefix("<Message") {
        Some(rest) => rest.starts_with('>') || rest.starts_with(char::is_whitespace),
        None => false,
    }
}

/// Текст первого элемента `tag` в документе, если он есть и непуст.
pub fn element_text(raw: &str, tag: &str) -> Option<String> {
    let open_plain = format!("<{}>", tag);
    let open_attrs = format!("<{} ", tag);
    let close = format!("</{}>", tag);

    let content_start = if let Some(i) = raw.find(&open_plain) {
        i + open_plain.len()
    } else if let Some(i) = raw.find(&open_attrs) {
        let rest = &raw[i..];
        i + rest.find('>')? + 1
    } else {
        return None;
    };

    let rest = &raw[content_start..];
    let content = &rest[..rest.find(&close)?];
    let content = content.trim();
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

/// Поля документа `<Message>`, которые мы переносим в транзакцию.
#[derive(Debug, Default, Clone)]
pub struct GatewayMessage {
    pub masked_pan: Option<String>,
    pub purchase_amount: Option<Decimal>,
    pub currency: Option<String>,
    pub response_description: Option<String>,
    pub order_status: Option<String>,
    pub order_description: Option<String>,
    pub response_status: Option<String>,
    pub merchant_transaction_id: Option<String>,
    pub approval_code: Option<String>,
}

impl GatewayMessage {
    pub fn parse(raw: &str) -> Self {
        GatewayMessage {
            masked_pan: element_text(raw, "PAN"),
            purchase_amount: element_text(raw, "PurchaseAmountScr")
                .and_then(|s| s.parse().ok()),
            currency: element_text(raw, "CurrencyScr").or_else(|| element_text(raw, "Currency")),
            response_description: element_text(raw, "ResponseDescription"),
            order_status: element_text(raw, "OrderStatus"),
            order_description: element_text(raw, "OrderDescription"),
            response_status: element_text(raw, "Status"),
            merchant_transaction_id: element_text(raw, "MerchantTranID"),
            approval_code: element_text(raw, "ApprovalCode"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = "<Message><PAN>123XXX123</PAN>\
        <PurchaseAmountScr>200</PurchaseAmountScr><Currency>NGN</Currency>\
        <ResponseDescription>TestDescription</ResponseDescription>\
        <OrderStatus>APPROVED</OrderStatus><OrderDescription>TestOrder</OrderDescription>\
        <Status>00</Status><MerchantTranID>12345654321</MerchantTranID>\
        <ApprovalCode>123ABC</ApprovalCode></Message>";

    #[test]
    fn recognizes_message_root() {
        assert!(is_message(SAMPLE));
        assert!(is_message("<?xml version=\"1.0\"?>\n<Message version=\"1.0\"></Message>"));
        assert!(!is_message("<NoMessage></NoMessage>"));
        assert!(!is_message("plain text"));
    }

    #[test]
    fn parses_all_fields() {
        let msg = GatewayMessage::parse(SAMPLE);
        assert_eq!(msg.masked_pan.as_deref(), Some("123XXX123"));
        assert_eq!(msg.purchase_amount, Some(dec!(200)));
        assert_eq!(msg.currency.as_deref(), Some("NGN"));
        assert_eq!(msg.response_description.as_deref(), Some("TestDescription"));
        assert_eq!(msg.order_status.as_deref(), Some("APPROVED"));
        assert_eq!(msg.order_description.as_deref(), Some("TestOrder"));
        assert_eq!(msg.response_status.as_deref(), Some("00"));
        assert_eq!(msg.merchant_transaction_id.as_deref(), Some("12345654321"));
        assert_eq!(msg.approval_code.as_deref(), Some("123ABC"));
    }

    #[test]
    fn missing_and_empty_elements_are_none() {
        let msg = GatewayMessage::parse("<Message><PAN></PAN></Message>");
        assert!(msg.masked_pan.is_none());
        assert!(msg.approval_code.is_none());
        assert!(msg.purchase_amount.is_none());
    }

    #[test]
    fn element_with_attributes() {
        assert_eq!(
            element_text("<Message><Status code=\"x\">00</Status></Message>", "Status"),
            Some("00".to_string())
        );
    }

    #[test]
    fn unparseable_amount_is_none() {
        let msg = GatewayMessage::parse(
            "<Message><PurchaseAmountScr>abc</PurchaseAmountScr></Message>",
        );
        assert!(msg.purchase_amount.is_none());
    }
}
