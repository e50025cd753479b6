use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

use super::client::{build_type_locator, TeamCityClient};
use super::types::{BuildList, BuildPayload, CountResponse, Properties};
use crate::build::BuildState;
use crate::error::Result;
use crate::providers::{QueueProvider, SubmissionProvider};
use crate::queue::{BuildRequest, QueueEntry, QueuedBuild};

const QUEUE_FIELDS: &str =
    "build(id,buildTypeId,queuedDate,waitReason,startEstimate,snapshot-dependencies(build(id)))";
const MAX_BUILDS_SETTING: &str = "maximumNumberOfBuilds";

fn queue_body(request: &BuildRequest, move_to_top: bool) -> Value {
    let mut body = json!({
        "buildType": { "id": request.build_type_id },
        "personal": request.personal,
    });

    if let Some(branch) = &request.branch_name {
        body["branchName"] = json!(branch);
    }
    if let Some(comment) = &request.comment {
        body["comment"] = json!({ "text": comment });
    }
    if !request.parameters.is_empty() {
        let property: Vec<Value> = request
            .parameters
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        body["properties"] = json!({ "property": property });
    }
    if !request.dependencies.is_empty() {
        let build: Vec<Value> = request
            .dependencies
            .iter()
            .map(|dep| json!({ "id": dep.build_id }))
            .collect();
        body["snapshot-dependencies"] = json!({ "build": build });
    }
    if move_to_top {
        body["triggeringOptions"] = json!({ "queueAtTop": true });
    }

    body
}

impl TeamCityClient {
    async fn fetch_queue(&self) -> Result<Vec<BuildPayload>> {
        let mut url = self.endpoint("buildQueue")?;
        url.query_pairs_mut().append_pair("fields", QUEUE_FIELDS);
        let list: BuildList = self.fetch(self.get(url)).await?;
        Ok(list.build.into_vec())
    }

    async fn count(&self, path: &str, locator: &str) -> Result<usize> {
        let url = self.locator_endpoint(path, locator, Some("count"))?;
        let response: CountResponse = self.fetch(self.get(url)).await?;
        Ok(response.count)
    }

    /// 1-based position of a build in the live queue, 0 if it is not there.
    async fn position_of(&self, build_id: &str) -> Result<u32> {
        let queue = self.fetch_queue().await?;
        Ok(queue
            .iter()
            .position(|b| b.id == build_id)
            .map_or(0, |idx| idx as u32 + 1))
    }
}

#[async_trait]
impl SubmissionProvider for TeamCityClient {
    async fn add_build_to_queue(&self, request: &BuildRequest, move_to_top: bool) -> Result<QueuedBuild> {
        let url = self.endpoint("buildQueue")?;
        let body = queue_body(request, move_to_top);
        let payload: BuildPayload = self.fetch(self.post(url).json(&body)).await?;

        let position = match self.position_of(&payload.id).await {
            Ok(position) => position,
            Err(e) => {
                debug!("Could not look up queue position of build {}: {e}", payload.id);
                0
            }
        };

        let mut queued = payload.into_queued_build(position);
        if queued.build_type_id.is_empty() {
            queued.build_type_id = request.build_type_id.clone();
        }
        if queued.branch_name.is_none() {
            queued.branch_name = request.branch_name.clone();
        }
        if queued.parameters.is_empty() {
            queued.parameters = request.parameters.clone();
        }
        queued.personal |= request.personal;
        Ok(queued)
    }

    async fn cancel_queued_build(&self, build_id: &str, comment: Option<&str>) -> Result<()> {
        let url = self.endpoint(&format!("buildQueue/id:{build_id}"))?;
        let body = json!({
            "comment": comment.unwrap_or("Canceled from buildpilot"),
            "readdIntoQueue": false,
        });
        self.execute(self.post(url).json(&body)).await
    }

    async fn set_queued_builds_order(&self, build_ids: &[String]) -> Result<()> {
        let url = self.endpoint("buildQueue/order")?;
        let build: Vec<Value> = build_ids.iter().map(|id| json!({ "id": id })).collect();
        self.execute(self.put(url).json(&json!({ "build": build }))).await
    }
}

#[async_trait]
impl QueueProvider for TeamCityClient {
    async fn list_queued_builds(&self) -> Result<Vec<QueueEntry>> {
        Ok(self
            .fetch_queue()
            .await?
            .into_iter()
            .map(BuildPayload::into_queue_entry)
            .collect())
    }

    async fn build_state(&self, build_id: &str) -> Result<Option<BuildState>> {
        let mut url = self.endpoint(&format!("builds/id:{build_id}"))?;
        url.query_pairs_mut().append_pair("fields", "id,state");
        let payload: Option<BuildPayload> = self.fetch_optional(self.get(url)).await?;
        Ok(payload.and_then(|p| p.state.as_deref().and_then(BuildState::parse)))
    }

    async fn max_concurrent_builds(&self, build_type_id: &str) -> Result<Option<u32>> {
        let url = self.endpoint(&format!("buildTypes/id:{build_type_id}/settings"))?;
        let settings: Properties = self.fetch(self.get(url)).await?;
        let max = settings
            .into_map()
            .get(MAX_BUILDS_SETTING)
            .and_then(|value| value.trim().parse::<u32>().ok())
            .filter(|&max| max > 0);
        Ok(max)
    }

    async fn running_build_count(&self, build_type_id: &str) -> Result<usize> {
        let locator = format!("{},running:true", build_type_locator(build_type_id));
        self.count("builds", &locator).await
    }

    async fn queued_build_count(&self, build_type_id: &str) -> Result<usize> {
        self.count("buildQueue", &build_type_locator(build_type_id)).await
    }

    async fn personal_build_count(&self, build_type_id: &str) -> Result<usize> {
        let locator = format!("{},personal:true", build_type_locator(build_type_id));
        self.count("buildQueue", &locator).await
    }

    async fn compatible_agent_count(&self, build_type_id: &str) -> Result<usize> {
        let locator = format!(
            "compatible:({}),connected:true,authorized:true,enabled:true",
            build_type_locator(build_type_id)
        );
        self.count("agents", &locator).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_body_only_names_the_configuration() {
        let body = queue_body(&BuildRequest::new("App_Build"), false);
        assert_eq!(body, json!({ "buildType": { "id": "App_Build" }, "personal": false }));
    }

    #[test]
    fn full_body_keeps_parameter_order() {
        let request = BuildRequest {
            comment: Some("nightly".into()),
            personal: true,
            ..BuildRequest::new("App_Build")
                .with_branch("main")
                .with_parameter("env.Z", "1")
                .with_parameter("env.A", "2")
                .depends_on("77")
        };

        let body = queue_body(&request, true);
        assert_eq!(body["branchName"], "main");
        assert_eq!(body["comment"]["text"], "nightly");
        assert_eq!(body["personal"], true);
        assert_eq!(body["properties"]["property"][0]["name"], "env.Z");
        assert_eq!(body["properties"]["property"][1]["name"], "env.A");
        assert_eq!(body["snapshot-dependencies"]["build"][0]["id"], "77");
        assert_eq!(body["triggeringOptions"]["queueAtTop"], true);
    }
}
