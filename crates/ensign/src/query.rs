//! EnSQL front-end: authorize the caller, parse the statement, resolve its topic in
//! the caller's project, then execute it over the committed events of the topic.

use ensign_api::v1beta1::{EventWrapper, Query as QueryRequest, QueryExplanation};
use ensign_store::{DataStore, MetaStore};
use tonic::{Code, Status};
use ulid::Ulid;

use crate::auth::permissions;
use crate::context::{Context, UNAUTHORIZED};
use crate::ensql::{self, executor, Query};
use crate::server::Node;
use crate::streams::Outbound;
use crate::topics::project_id;

pub const UNKNOWN_TOPIC: &str = "unknown topic in query";

/// Parse the query and resolve its topic, returning the topic id and plan.
async fn prepare(node: &Node, ctx: &Context, req: &QueryRequest) -> Result<(Ulid, Query), Status> {
    let claims = ctx.claims()?;
    if !claims.has_any_permission(&[permissions::SUBSCRIBER, permissions::READ_TOPICS]) {
        return Err(Status::unauthenticated(UNAUTHORIZED));
    }
    let project_id = project_id(claims)?;

    if req.query.trim().is_empty() {
        return Err(Status::invalid_argument(ensql::Error::EmptyQuery.to_string()));
    }

    let query = ensql::parse(&req.query).map_err(|err| {
        tracing::debug!(error = %err, query = %req.query, "could not parse query");
        Status::invalid_argument(err.to_string())
    })?;

    match node.meta.lookup_topic_name(&query.topic.topic, project_id).await {
        Ok(topic_id) => Ok((topic_id, query)),
        Err(err) if err.is_not_found() => {
            tracing::debug!(topic = %query.topic.topic, "could not lookup topic in query");
            Err(Status::invalid_argument(UNKNOWN_TOPIC))
        }
        Err(err) => {
            tracing::error!(report = true, error = %err, topic = %query.topic.topic, "could not lookup topic name");
            Err(Status::internal("could not execute query"))
        }
    }
}

/// Execute the query, streaming matching events in commit order.
pub async fn ensql(
    node: &Node,
    ctx: &Context,
    req: QueryRequest,
    outbound: Outbound<EventWrapper>,
) -> Result<(), Status> {
    let (topic_id, query) = prepare(node, ctx, &req).await?;
    if !req.params.is_empty() {
        tracing::debug!(params = req.params.len(), "ignoring query parameters");
    }

    tracing::debug!(query = %query.raw, topic_id = %topic_id, "starting ensql query execution");
    let events = node.data.list(topic_id).await.map_err(|err| {
        tracing::error!(report = true, error = %err, topic_id = %topic_id, "could not retrieve events from database");
        Status::internal("could not execute query")
    })?;

    let (results, stats) = executor::execute(&query, &events, req.include_duplicates)
        .map_err(|err| Status::invalid_argument(err.to_string()))?;

    for event in results {
        if let Err(err) = outbound.send(event).await {
            if err.code() == Code::Cancelled {
                tracing::debug!("query stream closed by client");
                return Ok(());
            }
            tracing::warn!(error = %err, "ensql query stream crashed");
            return Err(Status::aborted("query stream aborted"));
        }
    }

    tracing::info!(
        topic_id = %topic_id,
        scanned = stats.scanned,
        returned = stats.returned,
        "ensql query executed"
    );
    Ok(())
}

pub async fn explain(node: &Node, ctx: &Context, req: QueryRequest) -> Result<QueryExplanation, Status> {
    let (topic_id, query) = prepare(node, ctx, &req).await?;
    tracing::debug!(query = %query.raw, topic_id = %topic_id, "explain requested");
    Err(Status::unimplemented("explain query is not implemented yet"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{methods, tests::context};
    use crate::server::tests::node;
    use ensign_api::rlid::Rlid;
    use ensign_api::v1beta1::{Event, MimeType, Topic};

    const PROJECT: &str = "01GQ7P8DNR9MR64RJR9D64FFNT";

    async fn seed(node: &Node) -> Ulid {
        let topic = node
            .meta
            .create_topic(Topic {
                project_id: Ulid::from_string(PROJECT).unwrap().to_bytes().to_vec(),
                name: "people".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let topic_id = topic.parse_topic_id().unwrap();

        for (seq, (name, age)) in [("alice", 34), ("bob", 19), ("carol", 52)].into_iter().enumerate() {
            let mut event = EventWrapper::for_topic(
                topic_id,
                &Event {
                    data: serde_json::to_vec(&serde_json::json!({"name": name, "age": age})).unwrap(),
                    mimetype: MimeType::ApplicationJson as i32,
                    ..Default::default()
                },
            );
            event.id = Rlid::make(seq as u32 + 1).to_vec();
            node.data.insert(&event).await.unwrap();
        }
        topic_id
    }

    fn request(query: &str) -> QueryRequest {
        QueryRequest {
            query: query.into(),
            ..Default::default()
        }
    }

    async fn run(node: &Node, ctx: &Context, query: &str) -> Result<Vec<EventWrapper>, Status> {
        let (outbound, stream) = Outbound::channel(ctx);
        ensql(node, ctx, request(query), outbound).await?;

        let mut rx = stream.into_inner();
        let mut events = Vec::new();
        while let Some(msg) = rx.recv().await {
            events.push(msg?);
        }
        Ok(events)
    }

    #[tokio::test]
    async fn test_ensql() {
        let node = node();
        seed(&node).await;
        let ctx = context(&methods::ENSQL, &[permissions::SUBSCRIBER]);

        assert_eq!(run(&node, &ctx, "SELECT * FROM people").await.unwrap().len(), 3);
        assert_eq!(
            run(&node, &ctx, "SELECT * FROM people WHERE age > 21").await.unwrap().len(),
            2
        );
        assert_eq!(
            run(&node, &ctx, "SELECT * FROM people OFFSET 1 LIMIT 1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_ensql_errors() {
        let node = node();
        seed(&node).await;
        let ctx = context(&methods::ENSQL, &[permissions::SUBSCRIBER]);

        let err = run(&node, &ctx, "").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "empty query is invalid");

        let err = run(&node, &ctx, "SELECT * FROM people LIMIT 5 OFFSET 3 LIMIT 6").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.message().contains("limit has already been set"));

        let err = run(&node, &ctx, "SELECT * FROM planets").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), UNKNOWN_TOPIC);

        let ctx = context(&methods::ENSQL, &[permissions::PUBLISHER]);
        let err = run(&node, &ctx, "SELECT * FROM people").await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_explain() {
        let node = node();
        seed(&node).await;
        let ctx = context(&methods::EXPLAIN, &[permissions::SUBSCRIBER]);

        let err = explain(&node, &ctx, request("SELECT * FROM people")).await.unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = explain(&node, &ctx, request("SELECT * FROM planets")).await.unwrap_err();
        assert_eq!(err.message(), UNKNOWN_TOPIC);
    }
}
