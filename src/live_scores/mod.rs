pub mod espn;
pub mod provider;

pub use espn::EspnScoreboard;
pub use provider::ScoreboardSource;
