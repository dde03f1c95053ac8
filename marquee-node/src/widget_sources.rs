use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::WidgetsConfig;

#[derive(Debug, thiserror::Error)]
pub enum WidgetError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unknown location '{0}'")]
    UnknownLocation(String),
    #[error("unreadable feed: {0}")]
    Feed(String),
    #[error("rate provider error: {0}")]
    Rates(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReport {
    pub place: String,
    pub temperature_c: f64,
    pub wind_kmh: f64,
    pub code: i64,
}

impl WeatherReport {
    /// Short description of a WMO weather code.
    pub fn summary(&self) -> &'static str {
        match self.code {
            0 => "Clear",
            1..=3 => "Partly cloudy",
            45 | 48 => "Fog",
            51..=57 => "Drizzle",
            61..=67 | 80..=82 => "Rain",
            71..=77 | 85 | 86 => "Snow",
            95..=99 => "Thunderstorm",
            _ => "Unsettled",
        }
    }
}

/// Outside data for the decorative widgets.
#[async_trait]
pub trait WidgetSources: Send + Sync {
    async fn weather(&self, location: &str) -> Result<WeatherReport, WidgetError>;
    async fn headlines(&self, feed_url: &str) -> Result<Vec<String>, WidgetError>;
    async fn rates(&self, base: &str, symbols: &[String]) -> Result<Vec<(String, f64)>, WidgetError>;
}

#[derive(Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<GeocodingPlace>,
}

#[derive(Deserialize)]
struct GeocodingPlace {
    name: String,
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct ForecastResponse {
    current_weather: CurrentWeather,
}

#[derive(Deserialize)]
struct CurrentWeather {
    temperature: f64,
    windspeed: f64,
    weathercode: i64,
}

#[derive(Deserialize)]
struct RatesResponse {
    result: String,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

pub struct HttpWidgetSources {
    client: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
    rates_url: String,
}

impl HttpWidgetSources {
    pub fn new(config: &WidgetsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            geocoding_url: config.geocoding_url.clone(),
            forecast_url: config.forecast_url.clone(),
            rates_url: config.rates_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl WidgetSources for HttpWidgetSources {
    async fn weather(&self, location: &str) -> Result<WeatherReport, WidgetError> {
        let places: GeocodingResponse = self
            .client
            .get(&self.geocoding_url)
            .query(&[("name", location), ("count", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let place = places
            .results
            .into_iter()
            .next()
            .ok_or_else(|| WidgetError::UnknownLocation(location.to_string()))?;

        let forecast: ForecastResponse = self
            .client
            .get(&self.forecast_url)
            .query(&[
                ("latitude", place.latitude.to_string()),
                ("longitude", place.longitude.to_string()),
                ("current_weather", "true".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(WeatherReport {
            place: place.name,
            temperature_c: forecast.current_weather.temperature,
            wind_kmh: forecast.current_weather.windspeed,
            code: forecast.current_weather.weathercode,
        })
    }

    async fn headlines(&self, feed_url: &str) -> Result<Vec<String>, WidgetError> {
        let body = self
            .client
            .get(feed_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_headlines(&body)
    }

    async fn rates(&self, base: &str, symbols: &[String]) -> Result<Vec<(String, f64)>, WidgetError> {
        let response: RatesResponse = self
            .client
            .get(format!("{}/{}", self.rates_url, base))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.result != "success" {
            return Err(WidgetError::Rates(response.result));
        }
        pick_rates(&response.rates, symbols)
    }
}

fn pick_rates(
    rates: &HashMap<String, f64>,
    symbols: &[String],
) -> Result<Vec<(String, f64)>, WidgetError> {
    let picked: Vec<(String, f64)> = symbols
        .iter()
        .filter_map(|symbol| {
            let symbol = symbol.to_ascii_uppercase();
            rates.get(&symbol).map(|rate| (symbol, *rate))
        })
        .collect();
    if picked.is_empty() {
        return Err(WidgetError::Rates("none of the requested currencies are quoted".into()));
    }
    Ok(picked)
}

/// Item titles of an RSS 2.0 or Atom document, in feed order.
pub fn parse_headlines(xml: &str) -> Result<Vec<String>, WidgetError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut titles = Vec::new();
    let mut in_item = false;
    let mut in_title = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"item" | b"entry" => in_item = true,
                b"title" => in_title = in_item,
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"item" | b"entry" => in_item = false,
                b"title" => in_title = false,
                _ => {}
            },
            Ok(Event::Text(text)) if in_title => {
                let title = text.unescape().map_err(|e| WidgetError::Feed(e.to_string()))?;
                titles.push(title.into_owned());
            }
            Ok(Event::CData(data)) if in_title => {
                titles.push(String::from_utf8_lossy(&data.into_inner()).into_owned());
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(WidgetError::Feed(e.to_string())),
            _ => {}
        }
    }

    Ok(titles)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Canned widget data; `None` makes the matching call fail.
    #[derive(Default)]
    pub struct FakeSources {
        pub weather: Mutex<Option<WeatherReport>>,
        pub headlines: Mutex<Option<Vec<String>>>,
        pub rates: Mutex<Option<Vec<(String, f64)>>>,
    }

    #[async_trait]
    impl WidgetSources for FakeSources {
        async fn weather(&self, location: &str) -> Result<WeatherReport, WidgetError> {
            self.weather
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| WidgetError::UnknownLocation(location.to_string()))
        }

        async fn headlines(&self, _feed_url: &str) -> Result<Vec<String>, WidgetError> {
            self.headlines
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| WidgetError::Feed("offline".into()))
        }

        async fn rates(&self, _base: &str, _symbols: &[String]) -> Result<Vec<(String, f64)>, WidgetError> {
            self.rates
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| WidgetError::Rates("offline".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rss_titles() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
              <title>Station News</title>
              <item><title>Road works on Main St &amp; 5th</title></item>
              <item><title><![CDATA[Market opens <early>]]></title></item>
            </channel></rss>"#;
        assert_eq!(
            parse_headlines(xml).unwrap(),
            vec!["Road works on Main St & 5th", "Market opens <early>"]
        );
    }

    #[test]
    fn test_parse_atom_titles() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
              <title>Feed</title>
              <entry><title>First</title></entry>
            </feed>"#;
        assert_eq!(parse_headlines(xml).unwrap(), vec!["First"]);
    }

    #[test]
    fn test_broken_feed_is_an_error() {
        assert!(parse_headlines("<rss><item><title>x</item></rss>").is_err());
    }

    #[test]
    fn test_pick_rates_keeps_requested_order() {
        let rates = HashMap::from([
            ("EUR".to_string(), 0.92),
            ("GBP".to_string(), 0.79),
            ("JPY".to_string(), 151.2),
        ]);
        let symbols = vec!["gbp".to_string(), "EUR".to_string(), "XXX".to_string()];
        assert_eq!(
            pick_rates(&rates, &symbols).unwrap(),
            vec![("GBP".to_string(), 0.79), ("EUR".to_string(), 0.92)]
        );
        assert!(pick_rates(&rates, &["XXX".to_string()]).is_err());
    }

    #[test]
    fn test_weather_summary() {
        let report = WeatherReport {
            place: "Lisbon".into(),
            temperature_c: 21.0,
            wind_kmh: 10.0,
            code: 61,
        };
        assert_eq!(report.summary(), "Rain");
    }
}
