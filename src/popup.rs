use crate::dom::{NodeId, Rect};
use std::time::{Duration, Instant};
use tracing::debug;

pub const DEFAULT_HIDE_DELAY: Duration = Duration::from_millis(300);
/// Vertical gap between a marker's bottom edge and the popup.
pub const ANCHOR_GAP: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn below(rect: Rect) -> Self {
        Self {
            x: rect.left(),
            y: rect.bottom() + ANCHOR_GAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PopupState {
    Hidden,
    Visible {
        word: String,
        anchor: Position,
        marker: NodeId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum PopupEffect {
    Unmount { word: String },
    Mount { word: String, anchor: Position },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HideTimer {
    pub token: u64,
    pub deadline: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClickTarget<'a> {
    Marker {
        node: NodeId,
        word: &'a str,
        rect: Rect,
    },
    Popup,
    Outside,
}

#[derive(Debug)]
pub struct PopupController {
    state: PopupState,
    pending_hide: Option<HideTimer>,
    next_token: u64,
    hide_delay: Duration,
}

impl Default for PopupController {
    fn default() -> Self {
        Self::new(DEFAULT_HIDE_DELAY)
    }
}

impl PopupController {
    pub fn new(hide_delay: Duration) -> Self {
        Self {
            state: PopupState::Hidden,
            pending_hide: None,
            next_token: 0,
            hide_delay,
        }
    }

    pub fn state(&self) -> &PopupState {
        &self.state
    }

    pub fn is_visible(&self) -> bool {
        matches!(self.state, PopupState::Visible { .. })
    }

    pub fn visible_marker(&self) -> Option<NodeId> {
        match &self.state {
            PopupState::Visible { marker, .. } => Some(*marker),
            PopupState::Hidden => None,
        }
    }

    pub fn pending_hide(&self) -> Option<HideTimer> {
        self.pending_hide
    }

    pub fn marker_entered(&mut self, marker: NodeId, word: &str, rect: Rect) -> Vec<PopupEffect> {
        self.cancel_hide();
        if self.visible_marker() == Some(marker) {
            return Vec::new();
        }
        let mut effects = self.transition_hidden();
        let anchor = Position::below(rect);
        self.state = PopupState::Visible {
            word: word.to_string(),
            anchor,
            marker,
        };
        debug!(word, x = anchor.x, y = anchor.y, "popup shown");
        effects.push(PopupEffect::Mount {
            word: word.to_string(),
            anchor,
        });
        effects
    }

    /// Leaving a marker only arms the timer for the marker the popup belongs
    /// to; a late leave from a previous marker is ignored.
    pub fn marker_left(&mut self, marker: NodeId, now: Instant) {
        if self.visible_marker() == Some(marker) {
            self.arm_hide(now);
        }
    }

    pub fn popup_entered(&mut self) {
        self.cancel_hide();
    }

    pub fn popup_left(&mut self, now: Instant) {
        if self.is_visible() {
            self.arm_hide(now);
        }
    }

    pub fn clicked(&mut self, target: ClickTarget<'_>) -> Vec<PopupEffect> {
        match target {
            ClickTarget::Marker { node, word, rect } => self.marker_entered(node, word, rect),
            ClickTarget::Popup => Vec::new(),
            ClickTarget::Outside => self.hide(),
        }
    }

    pub fn hide(&mut self) -> Vec<PopupEffect> {
        self.transition_hidden()
    }

    /// Fires the hide timer identified by `token`. Tokens from cancelled or
    /// superseded timers do nothing.
    pub fn hide_timer_fired(&mut self, token: u64) -> Vec<PopupEffect> {
        match self.pending_hide {
            Some(timer) if timer.token == token => self.transition_hidden(),
            _ => Vec::new(),
        }
    }

    pub fn poll(&mut self, now: Instant) -> Vec<PopupEffect> {
        match self.pending_hide {
            Some(timer) if timer.deadline <= now => self.hide_timer_fired(timer.token),
            _ => Vec::new(),
        }
    }

    fn arm_hide(&mut self, now: Instant) {
        self.next_token = self.next_token.wrapping_add(1);
        self.pending_hide = Some(HideTimer {
            token: self.next_token,
            deadline: now + self.hide_delay,
        });
    }

    fn cancel_hide(&mut self) {
        self.pending_hide = None;
    }

    fn transition_hidden(&mut self) -> Vec<PopupEffect> {
        self.cancel_hide();
        match std::mem::replace(&mut self.state, PopupState::Hidden) {
            PopupState::Visible { word, .. } => {
                debug!(word = %word, "popup hidden");
                vec![PopupEffect::Unmount { word }]
            }
            PopupState::Hidden => Vec::new(),
        }
    }
}
