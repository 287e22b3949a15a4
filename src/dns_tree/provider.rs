//! Abstract DNS TXT record provider, with thin adapters over Route53-like
//! and AliYun-like REST APIs. The wire TXT format is identical across
//! providers; only the HTTP call shapes differ.

use async_trait::async_trait;
use std::time::Duration;

use super::error::{TreeError, TreeResult};

/// `list_txt`, `upsert_txt`, `delete_txt`, `await_propagation`: the four
/// operations every concrete DNS backend must support.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn list_txt(&self, domain: &str) -> TreeResult<Vec<(String, String)>>;
    async fn upsert_txt(&self, name: &str, values: &[String], ttl: u32) -> TreeResult<String>;
    async fn delete_txt(&self, name: &str) -> TreeResult<String>;
    async fn await_propagation(&self, request_id: &str) -> TreeResult<()>;

    /// Maximum number of TXT value strings this provider accepts in one request.
    fn max_batch_size(&self) -> usize {
        50
    }
}

/// AWS Route53-like provider: change batches submitted to a hosted zone,
/// propagation polled by change-request id.
pub struct Route53Provider {
    client: reqwest::Client,
    endpoint: String,
    hosted_zone_id: String,
    api_token: String,
}

impl Route53Provider {
    pub fn new(endpoint: String, hosted_zone_id: String, api_token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            hosted_zone_id,
            api_token,
        }
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    async fn list_txt(&self, domain: &str) -> TreeResult<Vec<(String, String)>> {
        let url = format!(
            "{}/2013-04-01/hostedzone/{}/rrset?type=TXT&name={}",
            self.endpoint, self.hosted_zone_id, domain
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        Ok(parse_txt_list(&body))
    }

    async fn upsert_txt(&self, name: &str, values: &[String], ttl: u32) -> TreeResult<String> {
        let url = format!(
            "{}/2013-04-01/hostedzone/{}/rrset",
            self.endpoint, self.hosted_zone_id
        );
        let body = serde_json::json!({
            "Action": "UPSERT",
            "Name": name,
            "Type": "TXT",
            "TTL": ttl,
            "ResourceRecords": values,
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let reply: serde_json::Value = response.json().await?;
        Ok(reply["ChangeInfo"]["Id"].as_str().unwrap_or_default().to_string())
    }

    async fn delete_txt(&self, name: &str) -> TreeResult<String> {
        let url = format!(
            "{}/2013-04-01/hostedzone/{}/rrset",
            self.endpoint, self.hosted_zone_id
        );
        let body = serde_json::json!({ "Action": "DELETE", "Name": name, "Type": "TXT" });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let reply: serde_json::Value = response.json().await?;
        Ok(reply["ChangeInfo"]["Id"].as_str().unwrap_or_default().to_string())
    }

    async fn await_propagation(&self, request_id: &str) -> TreeResult<()> {
        let url = format!("{}/2013-04-01/change/{request_id}", self.endpoint);
        for _ in 0..10 {
            let response = self.client.get(&url).bearer_auth(&self.api_token).send().await?;
            let body: serde_json::Value = response.json().await?;
            if body["ChangeInfo"]["Status"] == "INSYNC" {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(TreeError::Provider(format!(
            "change {request_id} did not reach INSYNC in time"
        )))
    }

    fn max_batch_size(&self) -> usize {
        1000
    }
}

/// AliYun-like provider: record-set API keyed by record id rather than a
/// change-batch id; propagation is near-immediate so `await_propagation` is
/// a no-op poll.
pub struct AliyunProvider {
    client: reqwest::Client,
    endpoint: String,
    access_key_id: String,
    access_key_secret: String,
}

impl AliyunProvider {
    pub fn new(endpoint: String, access_key_id: String, access_key_secret: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            access_key_id,
            access_key_secret,
        }
    }

    fn signed_request(&self, action: &str) -> reqwest::RequestBuilder {
        self.client
            .get(&self.endpoint)
            .query(&[("Action", action), ("AccessKeyId", &self.access_key_id)])
            .header("X-Acs-Signature", &self.access_key_secret)
    }
}

#[async_trait]
impl DnsProvider for AliyunProvider {
    async fn list_txt(&self, domain: &str) -> TreeResult<Vec<(String, String)>> {
        let response = self
            .signed_request("DescribeDomainRecords")
            .query(&[("DomainName", domain), ("TypeKeyWord", "TXT")])
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        Ok(parse_txt_list(&body))
    }

    async fn upsert_txt(&self, name: &str, values: &[String], ttl: u32) -> TreeResult<String> {
        let value = values.first().cloned().unwrap_or_default();
        let response = self
            .signed_request("AddDomainRecord")
            .query(&[
                ("RR", name),
                ("Type", "TXT"),
                ("Value", value.as_str()),
                ("TTL", ttl.to_string().as_str()),
            ])
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        Ok(body["RecordId"].as_str().unwrap_or_default().to_string())
    }

    async fn delete_txt(&self, name: &str) -> TreeResult<String> {
        let response = self
            .signed_request("DeleteDomainRecord")
            .query(&[("RecordId", name)])
            .send()
            .await?;
        let body: serde_json::Value = response.json().await?;
        Ok(body["RecordId"].as_str().unwrap_or_default().to_string())
    }

    async fn await_propagation(&self, _request_id: &str) -> TreeResult<()> {
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        500
    }
}

fn parse_txt_list(body: &serde_json::Value) -> Vec<(String, String)> {
    body["records"]
        .as_array()
        .map(|records| {
            records
                .iter()
                .filter_map(|r| {
                    let name = r["name"].as_str()?.to_string();
                    let value = r["value"].as_str()?.to_string();
                    Some((name, value))
                })
                .collect()
        })
        .unwrap_or_default()
}
