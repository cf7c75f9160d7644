use std::fmt;

/// A time resolution in the rollup hierarchy, ordered finest to coarsest.
///
/// Each granularity covers 14 days of slots; a slot index is the timestamp
/// divided by the slot duration, wrapped into that ring. The hierarchy is
/// fixed at startup: every slot at one granularity maps to exactly one slot
/// at the next-coarser granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Min5,
    Min20,
    Min60,
    Min240,
    Min1440,
}

/// Error returned when asked for a parent of the coarsest granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no granularity coarser than {0}")]
pub struct InvalidGranularity(pub Granularity);

impl Granularity {
    /// All granularities, finest first.
    pub const ALL: [Granularity; 5] = [
        Granularity::Min5,
        Granularity::Min20,
        Granularity::Min60,
        Granularity::Min240,
        Granularity::Min1440,
    ];

    /// Slot width in milliseconds.
    pub const fn duration_ms(self) -> u64 {
        match self {
            Granularity::Min5 => 5 * 60_000,
            Granularity::Min20 => 20 * 60_000,
            Granularity::Min60 => 60 * 60_000,
            Granularity::Min240 => 240 * 60_000,
            Granularity::Min1440 => 1440 * 60_000,
        }
    }

    /// Number of slots in the ring (14 days at this resolution).
    pub const fn num_slots(self) -> u32 {
        match self {
            Granularity::Min5 => 4032,
            Granularity::Min20 => 1008,
            Granularity::Min60 => 336,
            Granularity::Min240 => 84,
            Granularity::Min1440 => 14,
        }
    }

    pub const fn finest() -> Granularity {
        Granularity::Min5
    }

    pub const fn coarsest() -> Granularity {
        Granularity::Min1440
    }

    pub const fn is_finest(self) -> bool {
        matches!(self, Granularity::Min5)
    }

    pub const fn is_coarsest(self) -> bool {
        matches!(self, Granularity::Min1440)
    }

    /// The next-coarser granularity, or `InvalidGranularity` at the top.
    pub fn coarser(self) -> Result<Granularity, InvalidGranularity> {
        match self {
            Granularity::Min5 => Ok(Granularity::Min20),
            Granularity::Min20 => Ok(Granularity::Min60),
            Granularity::Min60 => Ok(Granularity::Min240),
            Granularity::Min240 => Ok(Granularity::Min1440),
            Granularity::Min1440 => Err(InvalidGranularity(self)),
        }
    }

    /// The next-finer granularity, if any.
    pub fn finer(self) -> Option<Granularity> {
        match self {
            Granularity::Min5 => None,
            Granularity::Min20 => Some(Granularity::Min5),
            Granularity::Min60 => Some(Granularity::Min20),
            Granularity::Min240 => Some(Granularity::Min60),
            Granularity::Min1440 => Some(Granularity::Min240),
        }
    }

    /// Maps a unix-millisecond timestamp to its slot index at this resolution.
    pub fn slot(self, ts_ms: u64) -> u32 {
        ((ts_ms / self.duration_ms()) % u64::from(self.num_slots())) as u32
    }

    /// How many of this granularity's slots cover one slot of `coarser`.
    ///
    /// Callers must pass a strictly coarser granularity; the slot rings are
    /// sized so this is always an exact division.
    pub fn slots_per(self, coarser: Granularity) -> u32 {
        debug_assert!(coarser > self);
        self.num_slots() / coarser.num_slots()
    }

    /// Iterates the strictly coarser granularities, nearest first.
    pub fn ancestors(self) -> impl Iterator<Item = Granularity> {
        std::iter::successors(self.coarser().ok(), |g| g.coarser().ok())
    }

    /// Iterates the strictly finer granularities, nearest first.
    pub fn descendants(self) -> impl Iterator<Item = Granularity> {
        std::iter::successors(self.finer(), |g| g.finer())
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Granularity::Min5 => "5m",
            Granularity::Min20 => "20m",
            Granularity::Min60 => "60m",
            Granularity::Min240 => "240m",
            Granularity::Min1440 => "1440m",
        };
        f.write_str(name)
    }
}
