use crate::csi::proto::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, PluginCapability, ProbeRequest, ProbeResponse,
    identity_server::Identity,
};
use tonic::{Request, Response, Status};

pub const PLUGIN_NAME: &str = "restvirt.verbit.io";
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity Service implementation
///
/// Registered for both roles; advertises the controller service and
/// topology constraints.
#[derive(Debug, Clone)]
pub struct IdentityService {
    name: String,
    version: String,
}

impl IdentityService {
    pub fn new() -> Self {
        Self { name: PLUGIN_NAME.to_string(), version: PLUGIN_VERSION.to_string() }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        use crate::csi::proto::plugin_capability::{Service, Type as CapabilityType, service::Type};

        let capabilities = [Type::ControllerService, Type::VolumeAccessibilityConstraints]
            .into_iter()
            .map(|t| PluginCapability {
                r#type: Some(CapabilityType::Service(Service { r#type: t as i32 })),
            })
            .collect();

        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}
