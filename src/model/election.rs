use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::mongodb::Id;

/// The four instants that drive an election, in order.
///
/// Nomination runs over `[nomination_start, nomination_end]`, voting over
/// `[voting_start, voting_end]`; both windows are inclusive at each end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSchedule", into = "RawSchedule")]
pub struct Schedule {
    nomination_start: DateTime<Utc>,
    nomination_end: DateTime<Utc>,
    voting_start: DateTime<Utc>,
    voting_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("nomination must end after it starts")]
    EmptyNomination,
    #[error("voting cannot start before nomination ends")]
    Overlap,
    #[error("voting must end after it starts")]
    EmptyVoting,
}

impl Schedule {
    pub fn new(
        nomination_start: DateTime<Utc>,
        nomination_end: DateTime<Utc>,
        voting_start: DateTime<Utc>,
        voting_end: DateTime<Utc>,
    ) -> Result<Self, ScheduleError> {
        if nomination_end <= nomination_start {
            return Err(ScheduleError::EmptyNomination);
        }
        if voting_start < nomination_end {
            return Err(ScheduleError::Overlap);
        }
        if voting_end <= voting_start {
            return Err(ScheduleError::EmptyVoting);
        }
        Ok(Self {
            nomination_start,
            nomination_end,
            voting_start,
            voting_end,
        })
    }

    pub fn nomination_start(&self) -> DateTime<Utc> {
        self.nomination_start
    }

    pub fn nomination_end(&self) -> DateTime<Utc> {
        self.nomination_end
    }

    pub fn voting_start(&self) -> DateTime<Utc> {
        self.voting_start
    }

    pub fn voting_end(&self) -> DateTime<Utc> {
        self.voting_end
    }

    /// Where in its lifetime the election is at the given instant.
    pub fn status_at(&self, now: DateTime<Utc>) -> ElectionStatus {
        if now < self.nomination_start {
            ElectionStatus::Upcoming
        } else if now <= self.nomination_end {
            ElectionStatus::Nomination
        } else if now < self.voting_start {
            ElectionStatus::NominationClosed
        } else if now <= self.voting_end {
            ElectionStatus::Voting
        } else {
            ElectionStatus::Closed
        }
    }

    pub fn nomination_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == ElectionStatus::Nomination
    }

    pub fn voting_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == ElectionStatus::Voting
    }
}

/// Database representation of a [`Schedule`]; only converted back after validation.
#[derive(Serialize, Deserialize)]
struct RawSchedule {
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    nomination_start: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    nomination_end: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    voting_start: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    voting_end: DateTime<Utc>,
}

impl TryFrom<RawSchedule> for Schedule {
    type Error = ScheduleError;

    fn try_from(raw: RawSchedule) -> Result<Self, Self::Error> {
        Schedule::new(
            raw.nomination_start,
            raw.nomination_end,
            raw.voting_start,
            raw.voting_end,
        )
    }
}

impl From<Schedule> for RawSchedule {
    fn from(schedule: Schedule) -> Self {
        Self {
            nomination_start: schedule.nomination_start,
            nomination_end: schedule.nomination_end,
            voting_start: schedule.voting_start,
            voting_end: schedule.voting_end,
        }
    }
}

/// Status label derived purely from the current time and the schedule.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionStatus {
    Upcoming,
    Nomination,
    NominationClosed,
    Voting,
    Closed,
}

/// A Class-Representative election for a single class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    #[serde(rename = "_id")]
    pub id: Id,
    pub class_id: Id,
    pub name: String,
    #[serde(flatten)]
    pub schedule: Schedule,
    /// Set by the lifecycle clock at nomination start, cleared at closure.
    pub active: bool,
    /// Set by the lifecycle clock once voting has ended.
    pub published: bool,
}

impl Election {
    /// Create a new, not yet activated election.
    pub fn new(class_id: Id, name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            id: Id::new(),
            class_id,
            name: name.into(),
            schedule,
            active: false,
            published: false,
        }
    }

    /// Can a ballot be accepted at the given instant?
    pub fn accepts_votes_at(&self, now: DateTime<Utc>) -> bool {
        self.active && self.schedule.voting_open_at(now)
    }
}
