//! Topic management RPCs. Every topic belongs to exactly one project and callers can
//! only see or modify topics of the project in their claims; topics of other
//! projects are reported as not found.

use ensign_api::parse_ulid_str;
use ensign_api::v1beta1::{
    topic_mod, topic_tombstone, PageInfo, Topic, TopicExistsInfo, TopicMod, TopicName,
    TopicNamesPage, TopicTombstone, TopicsPage,
};
use ensign_store::{DataStore, MetaStore, StoreError};
use tonic::Status;
use ulid::Ulid;

use crate::auth::{permissions, Claims};
use crate::context::{Context, UNAUTHORIZED};
use crate::server::Node;

pub const TOPIC_NOT_FOUND: &str = "topic not found";

/// The project of the caller; claims without a valid project are unauthorized.
pub(crate) fn project_id(claims: &Claims) -> Result<Ulid, Status> {
    match claims.parse_project_id() {
        Ok(project_id) if !project_id.is_nil() => Ok(project_id),
        Ok(_) | Err(_) => {
            tracing::warn!(project_id = %claims.project_id, "could not parse project id from claims");
            Err(Status::unauthenticated(UNAUTHORIZED))
        }
    }
}

fn page_error(err: StoreError, request: &str) -> Status {
    if err.is_invalid() {
        return Status::invalid_argument(err.to_string());
    }
    tracing::error!(report = true, error = %err, "could not list topics");
    Status::internal(format!("could not process {request} request"))
}

pub async fn list_topics(node: &Node, ctx: &Context, page: PageInfo) -> Result<TopicsPage, Status> {
    let claims = ctx.authorize(&[permissions::READ_TOPICS])?;
    let project_id = project_id(claims)?;

    node.meta
        .list_topics(project_id, &page)
        .await
        .map_err(|err| page_error(err, "list topics"))
}

pub async fn create_topic(node: &Node, ctx: &Context, topic: Topic) -> Result<Topic, Status> {
    let claims = ctx.authorize(&[permissions::CREATE_TOPICS])?;

    if topic.project_id.is_empty() {
        return Err(Status::invalid_argument("missing project id field"));
    }

    let project_id = topic.parse_project_id().map_err(|err| {
        tracing::warn!(error = %err, "could not parse project id from create topic request");
        Status::invalid_argument("invalid project id field")
    })?;

    if !claims.validate_project(project_id) {
        return Err(Status::unauthenticated(UNAUTHORIZED));
    }

    // Ids and timestamps are assigned by the node.
    let topic = Topic {
        id: Vec::new(),
        offset: 0,
        created: None,
        modified: None,
        ..topic
    };

    match node.meta.create_topic(topic).await {
        Ok(topic) => {
            tracing::info!(topic = %topic.name, project_id = %project_id, "topic created");
            Ok(topic)
        }
        Err(err) if err.is_invalid() => Err(Status::invalid_argument(err.to_string())),
        Err(StoreError::ReadOnly) => Err(Status::failed_precondition(StoreError::ReadOnly.to_string())),
        Err(err) => {
            tracing::error!(report = true, error = %err, "could not create topic");
            Err(Status::internal("could not process create topic request"))
        }
    }
}

/// Load a topic by id, hiding topics that belong to another project.
async fn project_topic(
    node: &Node,
    project_id: Ulid,
    topic_id: Ulid,
    request: &str,
) -> Result<Topic, Status> {
    let topic = match node.meta.retrieve_topic(topic_id).await {
        Ok(topic) => topic,
        Err(err) if err.is_not_found() => return Err(Status::not_found(TOPIC_NOT_FOUND)),
        Err(err) => {
            tracing::error!(report = true, error = %err, topic_id = %topic_id, "could not retrieve topic");
            return Err(Status::internal(format!("could not process {request} request")));
        }
    };

    match topic.parse_project_id() {
        Ok(owner) if owner == project_id => Ok(topic),
        Ok(_) => Err(Status::not_found(TOPIC_NOT_FOUND)),
        Err(err) => {
            tracing::error!(report = true, error = %err, topic_id = %topic_id, "unable to parse project id defined on stored topic");
            Err(Status::internal(format!("could not process {request} request")))
        }
    }
}

pub async fn retrieve_topic(node: &Node, ctx: &Context, topic: Topic) -> Result<Topic, Status> {
    let claims = ctx.authorize(&[permissions::READ_TOPICS])?;
    let project_id = project_id(claims)?;

    if topic.id.is_empty() {
        return Err(Status::invalid_argument("missing id field"));
    }
    let topic_id = topic
        .parse_topic_id()
        .map_err(|_| Status::invalid_argument("invalid id field"))?;

    project_topic(node, project_id, topic_id, "retrieve topic").await
}

/// Archive (make readonly) or destroy a topic.
pub async fn delete_topic(node: &Node, ctx: &Context, req: TopicMod) -> Result<TopicTombstone, Status> {
    let permission = match req.operation() {
        topic_mod::Operation::Archive => permissions::EDIT_TOPICS,
        topic_mod::Operation::Destroy => permissions::DESTROY_TOPICS,
        topic_mod::Operation::Noop => return Err(Status::invalid_argument("invalid operation field")),
    };

    let claims = ctx.authorize(&[permission])?;
    let project_id = project_id(claims)?;

    if req.id.trim().is_empty() {
        return Err(Status::invalid_argument("missing id field"));
    }
    let topic_id = parse_ulid_str(&req.id).map_err(|err| {
        tracing::warn!(error = %err, "could not parse id from delete topic request");
        Status::invalid_argument("invalid id field")
    })?;

    let mut topic = project_topic(node, project_id, topic_id, "delete topic").await?;
    let internal = |err: StoreError| {
        tracing::error!(report = true, error = %err, topic_id = %topic_id, "could not modify topic");
        Status::internal("could not process delete topic request")
    };

    let state = match req.operation() {
        topic_mod::Operation::Archive => {
            topic.readonly = true;
            node.meta.update_topic(topic).await.map_err(internal)?;
            tracing::info!(topic_id = %topic_id, "topic archived");
            topic_tombstone::Status::Readonly
        }
        _ => {
            node.data.destroy(topic_id).await.map_err(internal)?;
            node.meta.delete_topic(topic_id).await.map_err(internal)?;
            tracing::info!(topic_id = %topic_id, "topic destroyed");
            topic_tombstone::Status::Deleting
        }
    };

    Ok(TopicTombstone {
        id: topic_id.to_string(),
        state: state as i32,
    })
}

pub async fn topic_names(node: &Node, ctx: &Context, page: PageInfo) -> Result<TopicNamesPage, Status> {
    let claims = ctx.authorize(&[permissions::READ_TOPICS])?;
    let project_id = project_id(claims)?;

    node.meta
        .list_topic_names(project_id, &page)
        .await
        .map_err(|err| page_error(err, "topic names"))
}

pub async fn topic_exists(
    node: &Node,
    ctx: &Context,
    mut query: TopicName,
) -> Result<TopicExistsInfo, Status> {
    let claims = ctx.authorize(&[permissions::READ_TOPICS])?;
    let project_id = project_id(claims)?;

    if query.project_id.trim().is_empty() {
        query.project_id = project_id.to_string();
    } else {
        match parse_ulid_str(&query.project_id) {
            Ok(requested) if requested == project_id => {}
            Ok(_) => return Err(Status::unauthenticated(UNAUTHORIZED)),
            Err(_) => return Err(Status::invalid_argument("invalid project id field")),
        }
    }

    match node.meta.topic_exists(&query).await {
        Ok(info) => Ok(info),
        Err(err) if err.is_invalid() => Err(Status::invalid_argument(err.to_string())),
        Err(err) => {
            tracing::error!(report = true, error = %err, "could not check if topic exists");
            Err(Status::internal("could not process topic exists request"))
        }
    }
}
