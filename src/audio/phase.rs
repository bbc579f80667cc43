/// Lifecycle shared by every playback engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    Idle,
    Starting,
    Playing,
    /// Input is complete; waiting for queued audio to drain.
    Ending,
    Finished,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Start,
    Started,
    EndRequested,
    Drained,
    Cancel,
    Failed,
}

impl PlaybackPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlaybackPhase::Finished | PlaybackPhase::Cancelled)
    }

    /// Engine currently owns the output and may be producing sound.
    pub fn is_playing(self) -> bool {
        matches!(
            self,
            PlaybackPhase::Starting | PlaybackPhase::Playing | PlaybackPhase::Ending
        )
    }

    pub fn on(self, event: PhaseEvent) -> PlaybackPhase {
        use PhaseEvent as E;
        use PlaybackPhase as P;

        let next = match (self, event) {
            (p, _) if p.is_terminal() => p,
            (_, E::Cancel | E::Failed) => P::Cancelled,
            (P::Idle, E::Start) => P::Starting,
            (P::Starting, E::Started) => P::Playing,
            (P::Starting | P::Playing, E::EndRequested) => P::Ending,
            (P::Ending, E::Drained) => P::Finished,
            (p, _) => p,
        };
        if next == self && !self.is_terminal() {
            log::trace!("ignored {:?} in {:?}", event, self);
        }
        next
    }
}
