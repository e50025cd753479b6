use async_trait::async_trait;

use super::client::{build_type_locator, TeamCityClient};
use super::types::{parse_timestamp, BuildList, BuildPayload};
use crate::build::{BuildState, BuildStatus, StatusDetail};
use crate::error::Result;
use crate::providers::StatusProvider;

const STATUS_FIELDS: &str = "id,buildTypeId,state,status,statusText,percentageComplete,branchName,\
webUrl,queuedDate,startDate,finishDate,waitReason,queuePosition,personal,canceledInfo,\
running-info(percentageComplete,elapsedSeconds,estimatedTotalSeconds,currentStageText)";
const TEST_FIELDS: &str = "testOccurrences(count,passed,failed,ignored,muted)";
const PROBLEM_FIELDS: &str = "problemOccurrences(problemOccurrence(details,type))";

fn status_fields(detail: StatusDetail) -> String {
    let mut fields = STATUS_FIELDS.to_string();
    if detail.include_tests {
        fields.push(',');
        fields.push_str(TEST_FIELDS);
    }
    if detail.include_problems {
        fields.push(',');
        fields.push_str(PROBLEM_FIELDS);
    }
    fields
}

#[async_trait]
impl StatusProvider for TeamCityClient {
    async fn build_status(&self, build_id: &str, detail: StatusDetail) -> Result<Option<BuildStatus>> {
        let mut url = self.endpoint(&format!("builds/id:{build_id}"))?;
        url.query_pairs_mut().append_pair("fields", &status_fields(detail));
        let payload: Option<BuildPayload> = self.fetch_optional(self.get(url)).await?;
        Ok(payload.map(BuildPayload::into_status))
    }

    async fn queued_build(&self, build_id: &str) -> Result<Option<BuildStatus>> {
        let url = self.endpoint(&format!("buildQueue/id:{build_id}"))?;
        let payload: Option<BuildPayload> = self.fetch_optional(self.get(url)).await?;
        Ok(payload.map(|p| {
            let mut status = p.into_status();
            // Queue lookups only ever return queued builds
            status.state = BuildState::Queued;
            status
        }))
    }

    async fn recent_durations(&self, build_type_id: &str, limit: usize) -> Result<Vec<f64>> {
        let locator = format!(
            "{},state:finished,status:SUCCESS,count:{limit}",
            build_type_locator(build_type_id)
        );
        let url = self.locator_endpoint("builds", &locator, Some("build(id,startDate,finishDate)"))?;
        let list: BuildList = self.fetch(self.get(url)).await?;

        Ok(list
            .build
            .into_vec()
            .into_iter()
            .filter_map(|b| {
                let start = parse_timestamp(b.start_date.as_deref()?)?;
                let finish = parse_timestamp(b.finish_date.as_deref()?)?;
                let seconds = (finish - start).num_milliseconds() as f64 / 1000.0;
                (seconds > 0.0).then_some(seconds)
            })
            .collect())
    }
}
