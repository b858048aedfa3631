//! Status line classification for engine stdout.
//!
//! The engine reports state through free-form log lines rather than a
//! structured protocol, so control signals have to be recognized by marker.
//! The full recognizer table lives here: when the engine's output format
//! grows, this is the only place that changes. Anything unmatched is passed
//! through as `Unrecognized` and treated as plain log output, never an error.

use regex::Regex;

/// A classified interpretation of one line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    /// The core engine finished initializing and accepts commands.
    EngineReady,
    /// A trade completed with the given profit (in SOL).
    TradeExecuted {
        /// Realized profit; negative for a loss.
        profit: f64,
    },
    /// A transformer model was deployed inside the engine.
    TransformerDeployed,
    /// A trading strategy was activated.
    StrategyActivated,
    /// A structured JSON reply to a previously sent command.
    Reply {
        /// Correlation token echoed from the command's `timestamp` field.
        token: u64,
        /// Reply action name, e.g. `strategy_result`.
        action: String,
        /// The full reply object.
        payload: serde_json::Value,
    },
    /// Any line that matched no recognizer.
    Unrecognized {
        /// The raw line, unmodified.
        raw: String,
    },
}

/// Matches engine output lines against a fixed, ordered recognizer table.
///
/// First match wins. Classification is deterministic and has no side
/// effects; callers apply the returned events to their own state.
#[derive(Debug)]
pub struct StatusClassifier {
    ready: Regex,
    trade: Regex,
    transformer: Regex,
    strategy: Regex,
}

impl Default for StatusClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusClassifier {
    /// Build the classifier, compiling the recognizer table.
    ///
    /// # Panics
    ///
    /// Panics if a built-in pattern fails to compile, which would be a
    /// programming error caught by the unit tests.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Regex::new(r"FULLY OPERATIONAL").expect("valid ready pattern"),
            // Tolerant numeric token: optional sign, digits, optional
            // decimal part, bounded by the literal trade markers.
            trade: Regex::new(r"executed:\s*([+-]?\d+(?:\.\d+)?)\s*SOL")
                .expect("valid trade pattern"),
            transformer: Regex::new(r"Deployed transformer:").expect("valid transformer pattern"),
            strategy: Regex::new("[\u{26a1}\u{1f53a}\u{1f96a}]").expect("valid strategy pattern"),
        }
    }

    /// Classify a single line of engine stdout.
    #[must_use]
    pub fn classify(&self, line: &str) -> StatusEvent {
        // Structured replies are JSON objects; check those before the
        // free-text markers so a reply mentioning a marker still correlates.
        if let Some(event) = Self::parse_reply(line) {
            return event;
        }

        if self.ready.is_match(line) {
            return StatusEvent::EngineReady;
        }

        if let Some(caps) = self.trade.captures(line) {
            // A malformed number means the field is absent, not an error;
            // fall through to the remaining recognizers.
            if let Ok(profit) = caps[1].parse::<f64>() {
                return StatusEvent::TradeExecuted { profit };
            }
        }

        if self.transformer.is_match(line) {
            return StatusEvent::TransformerDeployed;
        }

        if self.strategy.is_match(line) {
            return StatusEvent::StrategyActivated;
        }

        StatusEvent::Unrecognized {
            raw: line.to_string(),
        }
    }

    /// Try to interpret a line as a JSON command reply.
    ///
    /// A reply is any JSON object carrying an `action` string and an
    /// unsigned integer `timestamp` (the echoed correlation token).
    fn parse_reply(line: &str) -> Option<StatusEvent> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let action = value.get("action")?.as_str()?.to_string();
        let token = value.get("timestamp")?.as_u64()?;
        Some(StatusEvent::Reply {
            token,
            action,
            payload: value,
        })
    }
}
