//! App/screen navigation. Pure state, no I/O.

use crate::input::LogicalEvent;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct NavigationState {
    pub app: usize,
    pub screen: usize,
}

/// Owns the current position. Indices stay valid for the screen counts it
/// was built with.
#[derive(Debug, Clone)]
pub struct Navigator {
    screen_counts: Vec<usize>,
    state: NavigationState,
}

impl Navigator {
    /// Counts of zero are treated as one screen.
    pub fn new(screen_counts: Vec<usize>) -> Self {
        let mut screen_counts: Vec<usize> = screen_counts.into_iter().map(|n| n.max(1)).collect();
        if screen_counts.is_empty() {
            screen_counts.push(1);
        }
        Self {
            screen_counts,
            state: NavigationState::default(),
        }
    }

    pub fn state(&self) -> NavigationState {
        self.state
    }

    pub fn apply(&mut self, event: LogicalEvent) -> NavigationState {
        match event {
            LogicalEvent::AppNext => {
                self.state.app = (self.state.app + 1) % self.screen_counts.len();
                self.state.screen = 0;
            }
            LogicalEvent::ScreenNext => {
                let count = self.screen_counts[self.state.app];
                self.state.screen = (self.state.screen + 1) % count;
            }
        }
        self.state
    }

    pub fn apply_all(&mut self, events: impl IntoIterator<Item = LogicalEvent>) -> NavigationState {
        for event in events {
            self.apply(event);
        }
        self.state
    }
}
