//! Project summary statistics computed from the topics of the caller's project.

use std::collections::HashSet;

use ensign_api::parse_ulid;
use ensign_api::v1beta1::{InfoRequest, ProjectInfo};
use ensign_store::MetaStore;
use tonic::Status;

use crate::auth::permissions;
use crate::context::Context;
use crate::server::Node;
use crate::topics::project_id;

pub async fn info(node: &Node, ctx: &Context, req: InfoRequest) -> Result<ProjectInfo, Status> {
    let claims = ctx.authorize(&[permissions::READ_TOPICS, permissions::READ_METRICS])?;
    let project_id = project_id(claims)?;

    let filter = req
        .topics
        .iter()
        .map(|topic_id| parse_ulid(topic_id))
        .collect::<Result<HashSet<_>, _>>()
        .map_err(|_| Status::invalid_argument("could not parse topic id in info request filter"))?;

    let internal = |err: ensign_store::StoreError| {
        tracing::error!(report = true, error = %err, project_id = %project_id, "could not compute project info");
        Status::internal("unable to process project info request")
    };

    let mut out = ProjectInfo {
        project_id: project_id.to_string(),
        ..Default::default()
    };

    for topic_id in node.meta.allowed_topics(project_id).await.map_err(internal)? {
        if !filter.is_empty() && !filter.contains(&topic_id) {
            continue;
        }

        let topic = node.meta.retrieve_topic(topic_id).await.map_err(internal)?;
        let info = node.meta.topic_info(topic_id).await.map_err(internal)?;

        out.topics += 1;
        if topic.readonly {
            out.readonly_topics += 1;
        }
        out.events += info.events;
        out.duplicates += info.duplicates;
        out.data_size_bytes += info.data_size_bytes;
        out.topic_info.push(info);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{methods, tests::context, UNAUTHORIZED};
    use crate::server::tests::node;
    use ensign_api::rlid::Rlid;
    use ensign_api::v1beta1::{Event, EventWrapper, Topic};
    use ensign_store::DataStore;
    use tonic::Code;
    use ulid::Ulid;

    const PROJECT: &str = "01GQ7P8DNR9MR64RJR9D64FFNT";

    async fn topic(node: &Node, name: &str, readonly: bool) -> Ulid {
        let topic = node
            .meta
            .create_topic(Topic {
                project_id: Ulid::from_string(PROJECT).unwrap().to_bytes().to_vec(),
                name: name.into(),
                readonly,
                ..Default::default()
            })
            .await
            .unwrap();
        topic.parse_topic_id().unwrap()
    }

    #[tokio::test]
    async fn test_info() {
        let node = node();
        let orders = topic(&node, "orders", false).await;
        let legacy = topic(&node, "legacy", true).await;

        for seq in 1..=4 {
            let mut event = EventWrapper::for_topic(
                orders,
                &Event {
                    data: vec![seq as u8; 10],
                    ..Default::default()
                },
            );
            event.id = Rlid::make(seq).to_vec();
            node.data.insert(&event).await.unwrap();
        }

        let ctx = context(&methods::INFO, &[permissions::READ_TOPICS, permissions::READ_METRICS]);
        let out = info(&node, &ctx, InfoRequest::default()).await.unwrap();
        assert_eq!(out.project_id, PROJECT);
        assert_eq!(out.topics, 2);
        assert_eq!(out.readonly_topics, 1);
        assert_eq!(out.events, 4);
        assert_eq!(out.topic_info.len(), 2);
        assert!(out.data_size_bytes > 0);

        let filtered = info(
            &node,
            &ctx,
            InfoRequest {
                topics: vec![legacy.to_bytes().to_vec()],
            },
        )
        .await
        .unwrap();
        assert_eq!(filtered.topics, 1);
        assert_eq!(filtered.readonly_topics, 1);
        assert_eq!(filtered.events, 0);

        let err = info(
            &node,
            &ctx,
            InfoRequest {
                topics: vec![b"foo".to_vec()],
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.message(), "could not parse topic id in info request filter");
    }

    #[tokio::test]
    async fn test_info_permissions() {
        let node = node();
        let ctx = context(&methods::INFO, &[permissions::READ_TOPICS]);
        let err = info(&node, &ctx, InfoRequest::default()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
        assert_eq!(err.message(), UNAUTHORIZED);
    }
}
