use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode, Url};

use crate::error::{Error, Result};
use crate::sample::{HeartRateRow, ImuRow, SensorRecord};


const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Where samples end up once they leave the device.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn save_sensor_data(&self, record: &SensorRecord) -> Result<()>;
}


pub struct HttpBackend {
    client: Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|err| Error::Network(format!("invalid backend url {base_url}: {err}")))?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(HttpBackend { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Network(format!("{} cannot be a base url", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn recent_heart_rate(&self, device_id: &str) -> Result<Vec<HeartRateRow>> {
        let url = self.endpoint(&["get-sensor-data", device_id])?;
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn recent_imu(&self, device_id: &str) -> Result<Vec<ImuRow>> {
        let url = self.endpoint(&["get-imu-data", device_id])?;
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Full CSV export of one device.
    pub async fn download_csv(&self, device_id: &str) -> Result<String> {
        let url = self.endpoint(&["download-data", device_id])?;
        let response = self.client.get(url).send().await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }

    /// CSV export of the rows whose timestamps were selected.
    pub async fn download_selected_csv(
        &self,
        device_id: &str,
        sensor_ids: &[String],
        imu_ids: &[String],
    ) -> Result<String> {
        let query = selection_query(sensor_ids, imu_ids).ok_or(Error::NothingSelected)?;
        let url = self.endpoint(&["download-selected-data", device_id])?;
        let response = self.client.get(url).query(&query).send().await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn save_sensor_data(&self, record: &SensorRecord) -> Result<()> {
        let url = self.endpoint(&["save-sensor-data"])?;
        let response = self.client.post(url).json(record).send().await?;
        check_status(response).await?;
        debug!("Saved {} sample at {}", record.device_id, record.timestamp);
        Ok(())
    }
}

fn selection_query(
    sensor_ids: &[String],
    imu_ids: &[String],
) -> Option<Vec<(&'static str, String)>> {
    let mut query = vec![];
    if !sensor_ids.is_empty() {
        query.push(("sensorIds", sensor_ids.join(",")));
    }
    if !imu_ids.is_empty() {
        query.push(("imuIds", imu_ids.join(",")));
    }
    if query.is_empty() { None } else { Some(query) }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(status_error(status, message))
}

fn status_error(status: StatusCode, message: String) -> Error {
    if status.is_server_error() {
        Error::Storage { status: status.as_u16() }
    } else {
        Error::Rejected { status: status.as_u16(), message }
    }
}
