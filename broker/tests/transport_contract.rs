// Allow our dollar.cents digit grouping convention (e.g., 100_00 = $100.00)
#![allow(clippy::inconsistent_digit_grouping)]

//! Transport contract tests, driven through `dyn Transport` / `dyn Connector`
//! the way the gateway uses them. No live TWS connection needed.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use optiondesk::{Instrument, OptionContract, OptionRight, Price, Symbol};
use optiondesk_broker::mock::{MockConnector, MockTransport, TcpBehavior};
use optiondesk_broker::{
    BrokerOrderType, BrokerSide, Connector, ErrorKind, Fieldset, MarketDataType, OrderTicket,
    ScannerSubscription, Transport, TransportError, TransportEvent, classify,
};

fn aapl() -> Symbol {
    Symbol::new("AAPL")
}

fn subscription(scan_code: &str, rows: usize) -> ScannerSubscription {
    ScannerSubscription {
        instrument: "STK".to_string(),
        location_code: "STK.US.MAJOR".to_string(),
        scan_code: scan_code.to_string(),
        number_of_rows: rows,
        filters: vec![("abovePrice".to_string(), "5".to_string())],
    }
}

async fn connect(connector: &dyn Connector, port: u16) -> Arc<dyn Transport> {
    connector.connect("127.0.0.1", port, 17).await.unwrap()
}

// ============================================================================
// Error classification
// ============================================================================

#[test]
fn connectivity_kinds() {
    assert!(TransportError::timeout("x").is_connectivity());
    assert!(TransportError::refused("x").is_connectivity());
    assert!(TransportError::disconnected("x").is_connectivity());
    assert!(!TransportError::subscription("x").is_connectivity());
    assert!(!TransportError::unsupported("x").is_connectivity());
}

#[test]
fn broker_codes_classify() {
    assert_eq!(TransportError::from_broker(354, "no").kind, ErrorKind::Subscription);
    assert_eq!(TransportError::from_broker(10167, "").kind, ErrorKind::Subscription);
    assert_eq!(TransportError::from_broker(1100, "").kind, ErrorKind::Disconnected);
    assert_eq!(TransportError::from_broker(201, "").kind, ErrorKind::Rejected);
    assert_eq!(
        classify(Some(324), "Duplicate scan subscription"),
        ErrorKind::DuplicateScannerSubscription
    );
    assert_eq!(classify(None, "Connection refused (os error 111)"), ErrorKind::ConnectionRefused);
    assert_eq!(classify(None, "something odd"), ErrorKind::Other);
}

#[test]
fn error_display_includes_code() {
    let err = TransportError::from_broker(200, "No security definition has been found");
    let text = err.to_string();
    assert!(text.contains("200"), "{text}");
    assert!(text.contains("No security definition"), "{text}");
}

// ============================================================================
// Connector
// ============================================================================

#[tokio::test(start_paused = true)]
async fn hanging_port_times_out_at_probe_deadline() {
    let connector = MockConnector::new().with_dead_port(7496, TcpBehavior::Hang);
    let started = tokio::time::Instant::now();
    let err = connector
        .probe_tcp("127.0.0.1", 7496, Duration::from_millis(750))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert_eq!(started.elapsed(), Duration::from_millis(750));
}

#[tokio::test]
async fn unknown_ports_refuse() {
    let connector: Arc<dyn Connector> = Arc::new(MockConnector::new());
    let err = connector.connect("127.0.0.1", 4001, 17).await.err().unwrap();
    assert_eq!(err.kind, ErrorKind::ConnectionRefused);
}

// ============================================================================
// Transport calls
// ============================================================================

#[tokio::test]
async fn option_snapshot_is_keyed_by_contract() {
    let expiry = NaiveDate::from_ymd_opt(2026, 11, 20).unwrap();
    let call = Instrument::Option(OptionContract::new(aapl(), expiry, OptionRight::Call, Price(150_00)));
    let mock = MockTransport::builder()
        .with_snapshot(
            &call,
            optiondesk_broker::QuoteSnapshot {
                bid: Some(Price(4_20)),
                ask: Some(Price(4_30)),
                ..Default::default()
            },
        )
        .build();
    let connector = MockConnector::new().with_port(4002, mock.clone());
    let transport = connect(&connector, 4002).await;

    let quote = transport.market_data_snapshot(&call).await.unwrap();
    assert_eq!(quote.bid, Some(Price(4_20)));
    assert!(quote.has_price());

    let put = Instrument::Option(OptionContract::new(aapl(), expiry, OptionRight::Put, Price(150_00)));
    let err = transport.market_data_snapshot(&put).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoSecurityDefinition);
    assert_eq!(mock.call_count("market_data_snapshot"), 2);
}

#[tokio::test]
async fn market_data_type_switch_changes_entitlement() {
    let mock = MockTransport::builder()
        .with_quote(aapl(), 189_50, 189_60)
        .entitled_to(&[MarketDataType::DelayedFrozen])
        .build();
    let transport: Arc<dyn Transport> = mock.clone();
    let stock = Instrument::Stock(aapl());

    assert_eq!(
        transport.market_data_snapshot(&stock).await.unwrap_err().kind,
        ErrorKind::Subscription
    );
    transport
        .set_market_data_type(MarketDataType::DelayedFrozen)
        .await
        .unwrap();
    assert!(transport.market_data_snapshot(&stock).await.is_ok());
    assert_eq!(mock.data_type_history(), vec![MarketDataType::DelayedFrozen]);
}

#[tokio::test]
async fn scanner_respects_row_limit() {
    let mock = MockTransport::builder()
        .with_scanner_rows("HOT_BY_VOLUME", &["AAPL", "MSFT", "TSLA", "NVDA"])
        .build();
    let transport: Arc<dyn Transport> = mock.clone();

    let rows = transport
        .market_scanner(&subscription("HOT_BY_VOLUME", 2))
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].symbol, "AAPL");
    assert!(
        transport
            .market_scanner(&subscription("UNKNOWN", 10))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn positions_may_be_unsupported() {
    let transport: Arc<dyn Transport> = MockTransport::builder().build();
    let err = transport.positions().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Unsupported);
}

#[tokio::test]
async fn order_ids_increase_and_placement_pushes_status() {
    let mock = MockTransport::builder().with_place_status("PreSubmitted").build();
    let transport: Arc<dyn Transport> = mock.clone();
    let mut events = transport.events();

    let first = transport.next_order_id().await.unwrap();
    let second = transport.next_order_id().await.unwrap();
    assert!(second > first);

    let ticket = OrderTicket {
        side: BrokerSide::Buy,
        quantity: 3.0,
        order_type: BrokerOrderType::Limit(Price(150_00)),
        time_in_force: "DAY".to_string(),
        account: Some("DU123".to_string()),
        order_ref: Some("ord-7".to_string()),
    };
    transport
        .place_order(second, &Instrument::Stock(aapl()), &ticket)
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        TransportEvent::OrderStatus(status) => {
            assert_eq!(status.order_id, second);
            assert_eq!(status.status, "PreSubmitted");
            assert_eq!(status.remaining, 3.0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(mock.placed_orders()[0].ticket, ticket);
}

#[tokio::test]
async fn account_subscription_streams_fieldsets() {
    let mock = MockTransport::builder()
        .with_account_fieldsets(vec![
            Fieldset::from_strs(&["6", "2", "NetLiquidation", "1000", "USD", "DU123"]),
            Fieldset::from_strs(&["54", "1", "DU123"]),
        ])
        .build();
    let transport: Arc<dyn Transport> = mock.clone();
    let mut events = transport.events();

    transport.req_account_updates(true, "DU123").await.unwrap();
    let mut kinds = Vec::new();
    for _ in 0..2 {
        if let TransportEvent::Fieldset(f) = events.recv().await.unwrap() {
            kinds.push(f.fields()[0].clone());
        }
    }
    assert_eq!(kinds, vec!["6", "54"]);
    assert_eq!(mock.call_count_for("req_account_updates", "DU123"), 1);
}

#[tokio::test]
async fn disconnected_session_fails_every_call() {
    let mock = MockTransport::builder()
        .fail_next("current_time", "", TransportError::timeout("slow"))
        .build();
    let transport: Arc<dyn Transport> = mock.clone();

    assert_eq!(transport.current_time().await.unwrap_err().kind, ErrorKind::Timeout);
    assert!(transport.current_time().await.is_ok());

    transport.disconnect().await;
    assert!(!mock.is_connected());
    let err = transport.next_order_id().await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Disconnected);
}
