//! Shared setup for route tests driven by `#[backend_test]`.

use rocket::{figment::Figment, http::Cookie, local::asynchronous::Client};

use crate::config::Config;
use crate::model::{
    auth::{Admin, AuthToken, Voter},
    election::Election,
    eligibility::EligibilityRecord,
    mongodb::Id,
    nomination::Nomination,
    student::Student,
    token::{TokenHasher, VotingToken},
};
use crate::store::{MemoryStore, VoteStore};

/// Rocket config for tests: defaults plus the application's secrets.
pub fn figment() -> Figment {
    rocket::Config::figment()
        .merge(("auth_ttl", 300))
        .merge(("sweep_interval", 3600))
        .merge(("jwt_secret", "jwt secret for tests"))
        .merge(("token_secret", "token secret for tests"))
}

/// A signed-in user, as seen by the routes.
pub struct Login {
    pub id: Id,
    cookie: Cookie<'static>,
}

impl Login {
    pub fn cookie(&self) -> Cookie<'static> {
        self.cookie.clone()
    }
}

fn config(client: &Client) -> &Config {
    client
        .rocket()
        .state::<Config>()
        .expect("config is managed")
}

/// Put a student on a fresh class roster and sign them in.
pub async fn login_student(client: &Client, store: &MemoryStore) -> Login {
    let student = Student::new(Id::new(), "Test Student", "student@example.edu");
    store.put_student(student.clone()).await;
    Login {
        id: student.id,
        cookie: AuthToken::<Voter>::new(student.id).into_cookie(config(client)),
    }
}

pub async fn login_admin(client: &Client, _store: &MemoryStore) -> Login {
    let id = Id::new();
    Login {
        id,
        cookie: AuthToken::<Admin>::new(id).into_cookie(config(client)),
    }
}

/// An active election for the signed-in student's class, in its voting
/// window, with the student enrolled and one approved candidate.
pub async fn running_election(store: &MemoryStore, login: &Login) -> (Election, Id) {
    let student = store
        .student(login.id)
        .await
        .unwrap()
        .expect("logged in as a student");

    let mut election = Election::voting_example(student.class_id);
    election.active = false;
    store.put_election(election.clone()).await;

    let hasher = TokenHasher::new(b"unused");
    let enrolment = (
        EligibilityRecord::new(student.id, election.id),
        VotingToken::new(student.id, election.id, hasher.issue().1, chrono::Utc::now()),
    );
    assert!(store
        .activate_election(election.id, vec![enrolment])
        .await
        .unwrap());
    election.active = true;

    let candidate = Id::new();
    store
        .put_nomination(Nomination::approved_example(election.id, candidate, "Ada"))
        .await;
    (election, candidate)
}
