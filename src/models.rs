use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw model features keyed by feature name. Ordered so that every transform
/// over them iterates deterministically.
pub type Features = BTreeMap<String, f64>;

/// Signed attribution per feature bucket.
pub type Explain = BTreeMap<String, f64>;

/// One prediction emitted by the upstream model for a game at a point in time.
///
/// Keyed by `(gid, ts)`; `ts` is milliseconds and strictly increases per game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub gid: String,
    pub ts: i64,
    pub raw_p_win: f64,
    #[serde(default)]
    pub features: Features,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub play_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PredictionRecord {
    pub fn new(gid: impl Into<String>, ts: i64, raw_p_win: f64) -> Self {
        Self {
            gid: gid.into(),
            ts,
            raw_p_win,
            features: Features::new(),
            play_id: None,
            description: None,
        }
    }

    pub fn with_feature(mut self, name: impl Into<String>, value: f64) -> Self {
        self.features.insert(name.into(), value);
        self
    }

    pub fn with_play(mut self, play_id: impl Into<String>, description: impl Into<String>) -> Self {
        self.play_id = Some(play_id.into());
        self.description = Some(description.into());
        self
    }

    /// Text indexed by the search service.
    pub fn searchable_text(&self) -> String {
        let mut text = self.gid.clone();
        if let Some(play_id) = &self.play_id {
            text.push(' ');
            text.push_str(play_id);
        }
        if let Some(description) = &self.description {
            text.push(' ');
            text.push_str(description);
        }
        text
    }
}

/// Bucket importances recorded for one smoothing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceEntry {
    pub ts: i64,
    pub buckets: Explain,
}

/// Current smoothed view of a game, as held by the hot cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub gid: String,
    pub ts: i64,
    pub p_win: f64,
    pub explain: Explain,
    /// Rolling importance window at this point, oldest first.
    #[serde(default)]
    pub window: Vec<ImportanceEntry>,
}

/// Read-only projection of an accepted record used for substring lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub gid: String,
    pub ts: i64,
    pub searchable_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub ts: i64,
    pub p_win: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub gid: String,
    pub points: Vec<HistoryPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopBucket {
    pub bucket: String,
    pub impact: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopBucketsResponse {
    pub gid: String,
    pub items: Vec<TopBucket>,
}

// ============================================================================
// Streaming protocol
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    GameState,
    Prediction,
    Shap,
    Error,
    Pong,
}

/// Where a streamed message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Live,
    Replay,
}

/// Frame pushed to streaming clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_win: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<Explain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<Vec<ImportanceEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<MessageSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StreamMessage {
    fn empty(kind: MessageKind) -> Self {
        Self {
            kind,
            gid: None,
            ts: None,
            p_win: None,
            explain: None,
            window: None,
            source: None,
            message: None,
        }
    }

    /// Opening frame for a game; carries the latest known point if there is one.
    pub fn game_state(gid: &str, latest: Option<&Snapshot>, source: MessageSource) -> Self {
        Self {
            gid: Some(gid.to_string()),
            ts: latest.map(|s| s.ts),
            p_win: latest.map(|s| s.p_win),
            source: Some(source),
            ..Self::empty(MessageKind::GameState)
        }
    }

    pub fn prediction(snapshot: &Snapshot, source: MessageSource) -> Self {
        Self {
            gid: Some(snapshot.gid.clone()),
            ts: Some(snapshot.ts),
            p_win: Some(snapshot.p_win),
            window: Some(snapshot.window.clone()),
            source: Some(source),
            ..Self::empty(MessageKind::Prediction)
        }
    }

    pub fn shap(snapshot: &Snapshot, source: MessageSource) -> Self {
        Self {
            gid: Some(snapshot.gid.clone()),
            ts: Some(snapshot.ts),
            p_win: Some(snapshot.p_win),
            explain: Some(snapshot.explain.clone()),
            window: Some(snapshot.window.clone()),
            source: Some(source),
            ..Self::empty(MessageKind::Shap)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::empty(MessageKind::Error)
        }
    }

    pub fn pong(ts: Option<i64>) -> Self {
        Self {
            ts,
            ..Self::empty(MessageKind::Pong)
        }
    }

    /// The prediction/shap pair emitted for one point of a timeline.
    pub fn pair(snapshot: &Snapshot, source: MessageSource) -> [Self; 2] {
        [
            Self::prediction(snapshot, source),
            Self::shap(snapshot, source),
        ]
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_searchable_text_includes_play_description() {
        let record = PredictionRecord::new("G1", 1000, 0.5).with_play("p-17", "Pass into the red zone");
        assert_eq!(record.searchable_text(), "G1 p-17 Pass into the red zone");
    }

    #[test]
    fn test_stream_message_wire_shape() {
        let snapshot = Snapshot {
            gid: "G1".to_string(),
            ts: 2000,
            p_win: 0.544,
            explain: Explain::from([("QB".to_string(), 0.1)]),
            window: Vec::new(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&StreamMessage::shap(&snapshot, MessageSource::Replay).to_json()).unwrap();

        assert_eq!(json["type"], "shap");
        assert_eq!(json["gid"], "G1");
        assert_eq!(json["ts"], 2000);
        assert_eq!(json["source"], "replay");
        assert!((json["explain"]["QB"].as_f64().unwrap() - 0.1).abs() < 1e-12);
        assert!(json.get("message").is_none());
    }

    #[test]
    fn test_error_frame_has_no_game_fields() {
        let json: serde_json::Value =
            serde_json::from_str(&StreamMessage::error("bad request").to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "bad request");
        assert!(json.get("gid").is_none());
    }
}
