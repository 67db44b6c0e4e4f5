use crate::{
    app::event_subscriber::{
        EventSink,
        EventSubscriber,
        EventTarget,
        FeedSink,
        Subscription,
    },
    error::{
        Error,
        TransportError,
    },
    events::{
        DomainEvent,
        EventKind,
    },
    game::{
        GameId,
        Identity,
        Wei,
    },
};
use futures::{
    SinkExt,
    Stream,
    StreamExt,
};
use serde::{
    Deserialize,
    Serialize,
};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        Message,
    },
};
use tracing::{
    debug,
    warn,
};
use url::Url;

/// Push adapter speaking JSON over a websocket.
///
/// After connecting it sends `{"type":"subscribe","game_id":N}`, or
/// `{"type":"subscribe","scope":"all"}` for the contract-wide feed. Each text
/// frame afterwards carries one event object or an array of them.
#[derive(Debug, Clone)]
pub struct WsEventSubscriber {
    url: Url,
}

impl WsEventSubscriber {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)
            .map_err(|e| TransportError::Connect(format!("invalid url {url}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TransportError::Connect(format!(
                "unsupported scheme {other}"
            ))),
        }
    }
}

impl EventSubscriber for WsEventSubscriber {
    type Subscription = WsSubscription;

    async fn open(
        &self,
        game_id: GameId,
        sink: EventSink,
    ) -> Result<WsSubscription, TransportError> {
        self.subscribe(SubscribeRequest::game(game_id), sink).await
    }

    async fn open_feed(&self, sink: FeedSink) -> Result<WsSubscription, TransportError> {
        self.subscribe(SubscribeRequest::all(), sink).await
    }
}

impl WsEventSubscriber {
    async fn subscribe<T: EventTarget>(
        &self,
        request: SubscribeRequest,
        target: T,
    ) -> Result<WsSubscription, TransportError> {
        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let request = serde_json::to_string(&request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;
        stream
            .send(Message::Text(request))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let scope = target.scope();
        debug!(?scope, url = %self.url, "subscribed to contract events");
        let reader = tokio::spawn(read_events(stream, target));
        Ok(WsSubscription {
            scope,
            reader: Some(reader),
        })
    }
}

/// Owns the reader task. Closing aborts it, which drops the socket.
#[derive(Debug)]
pub struct WsSubscription {
    scope: Option<GameId>,
    reader: Option<JoinHandle<()>>,
}

impl Subscription for WsSubscription {
    fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
            debug!(scope = ?self.scope, "closed event subscription");
        }
    }

    fn is_closed(&self) -> bool {
        self.reader.is_none()
    }
}

impl Drop for WsSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_events<S, T>(mut stream: S, sink: T)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    T: EventTarget,
{
    let scope = sink.scope();
    loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                sink.liveness_lost(e.to_string());
                return;
            }
            None => {
                sink.liveness_lost("event stream ended".to_string());
                return;
            }
        };
        match message {
            Message::Text(text) => {
                let events = decode_frame(&text, scope);
                if !sink.deliver(events) {
                    debug!(?scope, "listener gone; stopping event reader");
                    return;
                }
            }
            Message::Close(frame) => {
                sink.liveness_lost(format!("server closed event stream: {frame:?}"));
                return;
            }
            _ => {}
        }
    }
}

#[derive(Debug, Serialize)]
struct SubscribeRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    game_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<&'static str>,
}

impl SubscribeRequest {
    fn game(game_id: GameId) -> Self {
        Self {
            kind: "subscribe",
            game_id: Some(game_id.0),
            scope: None,
        }
    }

    fn all() -> Self {
        Self {
            kind: "subscribe",
            game_id: None,
            scope: Some("all"),
        }
    }
}

/// One pushed event. Amounts are decimal strings in wei.
#[derive(Debug, Default, Deserialize)]
struct EventDto {
    kind: String,
    game_id: u64,
    #[serde(default)]
    player: Option<String>,
    #[serde(default)]
    player1: Option<String>,
    #[serde(default)]
    player2: Option<String>,
    #[serde(default)]
    stake: Option<String>,
    #[serde(default)]
    column: Option<u8>,
    #[serde(default)]
    row: Option<u8>,
    #[serde(default)]
    move_number: Option<u32>,
    #[serde(default)]
    winner: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    amount: Option<String>,
}

fn required<T>(value: Option<T>, field: &str, kind: &str) -> Result<T, Error> {
    value.ok_or_else(|| Error::InvalidEvent(format!("{kind} is missing {field}")))
}

fn identity(raw: Option<String>, field: &str, kind: &str) -> Result<Identity, Error> {
    required(raw, field, kind)?.parse()
}

fn amount(raw: Option<String>, field: &str, kind: &str) -> Result<Wei, Error> {
    let raw = required(raw, field, kind)?;
    raw.parse()
        .map_err(|_| Error::InvalidEvent(format!("{kind} has invalid {field} {raw}")))
}

impl TryFrom<EventDto> for DomainEvent {
    type Error = Error;

    fn try_from(dto: EventDto) -> Result<Self, Self::Error> {
        let game_id = GameId(dto.game_id);
        let kind = dto.kind.as_str();
        let event = match kind {
            "GameCreated" => DomainEvent::created(
                game_id,
                identity(dto.player1.or(dto.player), "player1", kind)?,
                amount(dto.stake, "stake", kind)?,
            ),
            "GameStarted" => {
                DomainEvent::started(game_id, identity(dto.player2, "player2", kind)?)
            }
            "MovePlayed" => DomainEvent::move_played(
                game_id,
                required(dto.column, "column", kind)?,
                required(dto.row, "row", kind)?,
                identity(dto.player, "player", kind)?,
                dto.move_number,
            ),
            "GameWon" => DomainEvent::won(game_id, identity(dto.winner, "winner", kind)?),
            "GameDraw" => DomainEvent::draw(game_id),
            "PrizeDistributed" => DomainEvent::prize_distributed(
                game_id,
                identity(dto.recipient, "recipient", kind)?,
                amount(dto.amount, "amount", kind)?,
            ),
            other => DomainEvent::new(game_id, EventKind::Unknown(other.to_string())),
        };
        Ok(event)
    }
}

/// Decodes one text frame, dropping malformed entries and, with a scope,
/// other games.
pub(crate) fn decode_frame(text: &str, scope: Option<GameId>) -> Vec<DomainEvent> {
    let items = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(item @ serde_json::Value::Object(_)) => vec![item],
        Ok(other) => {
            warn!(?scope, frame = %other, "unexpected event frame");
            return Vec::new();
        }
        Err(e) => {
            warn!(?scope, error = %e, "undecodable event frame");
            return Vec::new();
        }
    };
    items
        .into_iter()
        .filter(|item| {
            // acknowledgements and other control messages carry no kind
            let is_event = item.get("kind").is_some();
            if !is_event {
                debug!(?scope, message = %item, "skipping control message");
            }
            is_event
        })
        .filter_map(|item| {
            serde_json::from_value::<EventDto>(item)
                .map_err(|e| Error::InvalidEvent(e.to_string()))
                .and_then(DomainEvent::try_from)
                .inspect_err(|e| warn!(?scope, error = %e, "skipping malformed event"))
                .ok()
        })
        .filter(|event| scope.is_none_or(|game_id| event.game_id == game_id))
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::app::event_subscriber::{
        Delivery,
        FeedDelivery,
    };
    use futures::stream;

    const GAME: GameId = GameId(4);
    const ALICE: &str = "0x1111111111111111111111111111111111111111";

    #[test]
    fn decode_frame__single_move__yields_one_event() {
        // given
        let frame = format!(
            r#"{{"kind":"MovePlayed","game_id":4,"player":"{ALICE}","column":3,"row":0,"move_number":1}}"#
        );

        // when
        let events = decode_frame(&frame, Some(GAME));

        // then
        assert_eq!(
            events,
            vec![DomainEvent::move_played(
                GAME,
                3,
                0,
                Identity::new([0x11; 20]),
                Some(1)
            )]
        );
    }

    #[test]
    fn decode_frame__batch__keeps_order_and_drops_other_games() {
        let frame = format!(
            r#"[
                {{"kind":"GameWon","game_id":4,"winner":"{ALICE}"}},
                {{"kind":"GameDraw","game_id":9}},
                {{"kind":"PrizeDistributed","game_id":4,"recipient":"{ALICE}","amount":"200000000000000000"}}
            ]"#
        );

        let events = decode_frame(&frame, Some(GAME));

        assert_eq!(
            events,
            vec![
                DomainEvent::won(GAME, Identity::new([0x11; 20])),
                DomainEvent::prize_distributed(
                    GAME,
                    Identity::new([0x11; 20]),
                    Wei(200_000_000_000_000_000)
                ),
            ]
        );
    }

    #[test]
    fn decode_frame__malformed_entry__is_skipped() {
        let frame = r#"[
            {"kind":"MovePlayed","game_id":4,"column":3},
            {"kind":"GameDraw","game_id":4}
        ]"#;

        let events = decode_frame(frame, Some(GAME));

        assert_eq!(events, vec![DomainEvent::draw(GAME)]);
    }

    #[test]
    fn decode_frame__unknown_kind__is_preserved_as_unknown() {
        let events = decode_frame(r#"{"kind":"FeeChanged","game_id":4}"#, Some(GAME));

        assert_eq!(
            events,
            vec![DomainEvent::new(
                GAME,
                EventKind::Unknown("FeeChanged".to_string())
            )]
        );
    }

    #[test]
    fn decode_frame__ack_and_garbage__yield_nothing() {
        assert!(decode_frame(r#"{"type":"subscribed","game_id":4}"#, Some(GAME)).is_empty());
        assert!(decode_frame("not json", None).is_empty());
        assert!(decode_frame("42", None).is_empty());
    }

    #[test]
    fn decode_frame__without_scope__keeps_every_game() {
        let frame = r#"[
            {"kind":"GameDraw","game_id":4},
            {"kind":"GameDraw","game_id":9}
        ]"#;

        let events = decode_frame(frame, None);

        assert_eq!(
            events,
            vec![DomainEvent::draw(GAME), DomainEvent::draw(GameId(9))]
        );
    }

    #[test]
    fn subscribe_request__serialises_game_and_feed_forms() {
        assert_eq!(
            serde_json::to_string(&SubscribeRequest::game(GAME)).unwrap(),
            r#"{"type":"subscribe","game_id":4}"#
        );
        assert_eq!(
            serde_json::to_string(&SubscribeRequest::all()).unwrap(),
            r#"{"type":"subscribe","scope":"all"}"#
        );
    }

    #[test]
    fn new__http_scheme__is_rejected() {
        assert!(WsEventSubscriber::new("http://localhost:8080").is_err());
        assert!(WsEventSubscriber::new("wss://example.org/ws").is_ok());
    }

    #[tokio::test]
    async fn read_events__stream_ends__reports_liveness_lost_after_events() {
        // given
        let (sink, mut deliveries) = EventSink::detached(GAME);
        let frames = stream::iter(vec![Ok(Message::Text(
            r#"{"kind":"GameDraw","game_id":4}"#.to_string(),
        ))]);

        // when
        read_events(frames, sink).await;

        // then
        match deliveries.recv().await {
            Some(Delivery::Events { events, .. }) => {
                assert_eq!(events, vec![DomainEvent::draw(GAME)])
            }
            other => panic!("expected events, got {other:?}"),
        }
        assert!(matches!(
            deliveries.recv().await,
            Some(Delivery::LivenessLost { .. })
        ));
    }

    #[tokio::test]
    async fn read_events__feed_sink__receives_every_game() {
        // given
        let (sender, mut deliveries) = tokio::sync::mpsc::unbounded_channel();
        let sink = FeedSink::new(1, sender);
        let frames = stream::iter(vec![Ok(Message::Text(
            r#"[{"kind":"GameDraw","game_id":4},{"kind":"GameDraw","game_id":9}]"#
                .to_string(),
        ))]);

        // when
        read_events(frames, sink).await;

        // then
        match deliveries.recv().await {
            Some(FeedDelivery::Events { link, events }) => {
                assert_eq!(link, 1);
                assert_eq!(events.len(), 2);
            }
            other => panic!("expected events, got {other:?}"),
        }
        assert!(matches!(
            deliveries.recv().await,
            Some(FeedDelivery::LivenessLost { link: 1, .. })
        ));
    }

    #[tokio::test]
    async fn close__twice__is_idempotent() {
        let reader = tokio::spawn(std::future::pending::<()>());
        let mut subscription = WsSubscription {
            scope: Some(GAME),
            reader: Some(reader),
        };

        subscription.close();
        subscription.close();

        assert!(subscription.is_closed());
    }
}
