use serde::Deserialize;

/// One air-quality observation row as stored on disk.
///
/// Field order matches the headerless CSV layout of the dataset; the same
/// shape travels on the wire as `firequery.v1.Record`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FireRecord {
    /// Site latitude in degrees.
    pub latitude: f64,
    /// Site longitude in degrees.
    pub longitude: f64,
    /// Observation timestamp as recorded upstream (not normalized).
    pub timestamp: String,
    /// Pollutant tag (`PM2.5`, `PM10`, `OZONE`, ...).
    pub pollutant: String,
    /// Adjusted concentration value.
    pub concentration: f64,
    /// Concentration unit.
    pub unit: String,
    /// Unadjusted instrument reading.
    pub raw_concentration: f64,
    /// Air-quality index value.
    pub aqi: i32,
    /// AQI category bucket.
    pub aqi_category: i32,
    /// Monitoring site name.
    pub site_name: String,
    /// Reporting agency.
    pub agency: String,
    /// Short site identifier.
    pub site_id: String,
    /// Fully-qualified site identifier.
    pub full_site_id: String,
}
