use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tracing::warn;

use crate::indexer::{Freshness, IndexError, Snapshot, proposal_status};
use crate::models::decimal::parse_u256;
use crate::models::governance::{
    Candidate, CollectionResponse, FreshnessView, GovernanceItem, Proposal, ProposalWithStatus,
    VoteTallyResponse,
};
use crate::state::AppState;

use super::HttpError;

const MAX_LOOKUP_KEY_LEN: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/proposals", get(get_proposals))
        .route("/candidates", get(get_candidates))
        .route("/proposals/{key}", get(get_proposal))
        .route("/proposals/{key}/votes", get(get_proposal_votes))
}

impl From<Freshness> for FreshnessView {
    fn from(freshness: Freshness) -> Self {
        match freshness {
            Freshness::Cached => FreshnessView::Cached,
            Freshness::Refreshed => FreshnessView::Refreshed,
            Freshness::Stale => FreshnessView::Stale,
        }
    }
}

impl From<IndexError> for HttpError {
    fn from(err: IndexError) -> Self {
        HttpError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}

fn collection_response<T>(
    snapshot: Result<Snapshot<T>, IndexError>,
) -> CollectionResponse<T> {
    match snapshot {
        Ok(snapshot) => CollectionResponse {
            available: true,
            freshness: snapshot.freshness.into(),
            last_block: snapshot.last_block,
            items: snapshot.items,
        },
        Err(err) => {
            warn!("Serving empty collection: {err}");
            CollectionResponse {
                available: false,
                freshness: FreshnessView::Unavailable,
                last_block: 0,
                items: Vec::new(),
            }
        }
    }
}

fn with_status(proposal: Proposal, head: Option<u64>) -> ProposalWithStatus {
    ProposalWithStatus {
        status: head.map(|head| proposal_status(&proposal, head)),
        proposal,
    }
}

async fn get_proposals(
    State(state): State<AppState>,
) -> Json<CollectionResponse<ProposalWithStatus>> {
    let response = collection_response(state.index.list_proposals().await);
    let head = state.index.current_block_height().await.ok();

    Json(CollectionResponse {
        available: response.available,
        freshness: response.freshness,
        last_block: response.last_block,
        items: response
            .items
            .into_iter()
            .map(|proposal| with_status(proposal, head))
            .collect(),
    })
}

async fn get_candidates(State(state): State<AppState>) -> Json<CollectionResponse<Candidate>> {
    Json(collection_response(state.index.list_candidates().await))
}

#[derive(Debug, serde::Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum LookupView {
    Proposal(ProposalWithStatus),
    Candidate(Candidate),
}

async fn get_proposal(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<LookupView>, HttpError> {
    if key.len() > MAX_LOOKUP_KEY_LEN {
        return Err(HttpError::new(
            StatusCode::BAD_REQUEST,
            "lookup key is too long".to_string(),
        ));
    }

    let found = state.index.get_proposal_by_slug_or_id(&key).await?;
    match found {
        Some(GovernanceItem::Proposal(proposal)) => {
            let head = state.index.current_block_height().await.ok();
            Ok(Json(LookupView::Proposal(with_status(proposal, head))))
        }
        Some(GovernanceItem::Candidate(candidate)) => Ok(Json(LookupView::Candidate(candidate))),
        None => Err(HttpError::new(
            StatusCode::NOT_FOUND,
            format!("no proposal or candidate matches {key}"),
        )),
    }
}

async fn get_proposal_votes(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<VoteTallyResponse>, HttpError> {
    let proposal_id = parse_u256(&key).map_err(|err| {
        HttpError::new(
            StatusCode::BAD_REQUEST,
            format!("proposal id must be a decimal integer: {err}"),
        )
    })?;

    let tally = state.index.get_vote_tally(proposal_id).await?;
    Ok(Json(VoteTallyResponse {
        proposal_id: tally.proposal_id,
        counts: tally.counts,
        total_votes: tally.counts.total(),
        freshness: tally.freshness.into(),
        last_block: tally.last_block,
    }))
}
