use chrono::Utc;
use rocket::{serde::json::Json, Route, State};

use crate::{
    error::Result,
    model::{
        auth::{Admin, AuthToken},
        mongodb::Id,
    },
    store::SharedStore,
    voting::{admin_results, public_results, ElectionResults},
};

pub fn routes() -> Vec<Route> {
    routes![results_admin, results_non_admin]
}

#[get("/elections/<election_id>/results", rank = 1)]
async fn results_admin(
    _token: AuthToken<Admin>,
    election_id: Id,
    store: &State<SharedStore>,
) -> Result<Json<ElectionResults>> {
    let results = admin_results(store.inner().as_ref(), election_id, Utc::now()).await?;
    Ok(Json(results))
}

#[get("/elections/<election_id>/results", rank = 2)]
async fn results_non_admin(
    election_id: Id,
    store: &State<SharedStore>,
) -> Result<Json<ElectionResults>> {
    let results = public_results(store.inner().as_ref(), election_id).await?;
    Ok(Json(results))
}
