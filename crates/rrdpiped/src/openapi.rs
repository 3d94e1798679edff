//! OpenAPI documentation definition.

use rrdpipe_core::ReportingConfig;
use rrdpipe_core::query::{ExportMeta, ExportRecord, TimeUnit, WindowQuery};
use rrdpipe_core::realtime::{CpuUsage, RealtimeSample, VirtualMemory};
use rrdpipe_core::service::{GraphInfo, GraphRequest};
use utoipa::OpenApi;

use crate::handlers::{DataRequest, ErrorBody};

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::handle_health,
        crate::handlers::handle_config,
        crate::handlers::handle_graphs,
        crate::handlers::handle_data,
        crate::handlers::handle_stream,
        crate::handlers::handle_realtime,
    ),
    components(schemas(
        ReportingConfig,
        GraphInfo,
        GraphRequest,
        DataRequest,
        WindowQuery,
        TimeUnit,
        ExportRecord,
        ExportMeta,
        RealtimeSample,
        VirtualMemory,
        CpuUsage,
        ErrorBody,
    )),
    info(
        title = "rrdpipe API",
        version = "1.0",
        description = "collectd archive reporting: windowed exports, graph discovery and live SSE subscriptions"
    )
)]
pub(crate) struct ApiDoc;
