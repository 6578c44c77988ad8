//! gRPC glue shared by every FireQuery node.
//!
//! RPC schema source: `proto/fire_query.proto`.
//!
//! Generated under [`v1`]:
//! - `Query`, `Delegate` (server-streaming), `HealthCheck`, `CancelQuery`
//! - request/response types [`v1::QueryRequest`], [`v1::DelegationRequest`],
//!   [`v1::Chunk`], [`v1::Record`]
//!
//! This module also hosts the conversions between the on-disk
//! [`FireRecord`] shape and the wire [`v1::Record`], delegation payload
//! encode/decode, and request validation.

use fq_common::FqError;
use fq_storage::{FireRecord, LoadFilter};
use prost::Message;
use tonic::Status;

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("firequery.v1");
}

pub use v1::fire_query_client::FireQueryClient;
pub use v1::fire_query_server::{FireQuery, FireQueryServer};

/// Boxed response stream type shared by both streaming methods.
pub type ChunkStream =
    std::pin::Pin<Box<dyn tokio_stream::Stream<Item = Result<v1::Chunk, Status>> + Send>>;

/// Maps the crate error taxonomy onto RPC status codes.
pub fn to_status(err: FqError) -> Status {
    match err {
        FqError::InvalidConfig(msg) => Status::invalid_argument(msg),
        FqError::Query(msg) => Status::invalid_argument(msg),
        FqError::Unavailable(msg) => Status::failed_precondition(msg),
        FqError::Data(msg) => Status::internal(msg),
        FqError::Rpc(msg) => Status::internal(msg),
        FqError::Io(e) => Status::internal(e.to_string()),
    }
}

/// Encodes the original query for a delegation payload.
pub fn encode_query(query: &v1::QueryRequest) -> Vec<u8> {
    query.encode_to_vec()
}

/// Decodes the embedded original query of a delegation request.
pub fn decode_query(request: &v1::DelegationRequest) -> Result<v1::QueryRequest, Status> {
    v1::QueryRequest::decode(request.original_query.as_slice())
        .map_err(|e| Status::invalid_argument(format!("failed to parse original query: {e}")))
}

/// Validates the client-visible request contract.
pub fn validate_query(query: &v1::QueryRequest) -> Result<(), Status> {
    if query.date_start.is_empty() || query.date_end.is_empty() {
        return Err(Status::invalid_argument("date range must be set"));
    }
    if query.date_start > query.date_end {
        return Err(Status::invalid_argument(format!(
            "date_start {} is after date_end {}",
            query.date_start, query.date_end
        )));
    }
    if query.latitude_min < -90.0
        || query.latitude_max > 90.0
        || query.latitude_min > query.latitude_max
    {
        return Err(Status::invalid_argument("latitude bounds out of range"));
    }
    if query.longitude_min < -180.0
        || query.longitude_max > 180.0
        || query.longitude_min > query.longitude_max
    {
        return Err(Status::invalid_argument("longitude bounds out of range"));
    }
    if query.chunk_size < 1 {
        return Err(Status::invalid_argument("chunk_size must be >= 1"));
    }
    Ok(())
}

/// Data-source filter for a query's predicate set.
pub fn filter_from_query(query: &v1::QueryRequest) -> LoadFilter {
    LoadFilter {
        pollutant: if query.pollutant_type.is_empty() {
            None
        } else {
            Some(query.pollutant_type.clone())
        },
        lat_min: query.latitude_min,
        lat_max: query.latitude_max,
        lon_min: query.longitude_min,
        lon_max: query.longitude_max,
        max_records: query.max_records,
    }
}

/// Wire form of an on-disk record.
pub fn record_to_proto(record: FireRecord) -> v1::Record {
    v1::Record {
        latitude: record.latitude,
        longitude: record.longitude,
        timestamp: record.timestamp,
        pollutant: record.pollutant,
        concentration: record.concentration,
        unit: record.unit,
        raw_concentration: record.raw_concentration,
        aqi: record.aqi,
        aqi_category: record.aqi_category,
        site_name: record.site_name,
        agency: record.agency,
        site_id: record.site_id,
        full_site_id: record.full_site_id,
    }
}
