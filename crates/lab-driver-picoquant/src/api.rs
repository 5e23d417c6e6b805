//! Client bindings for the vendor `Sepia2` laser-control gRPC service.
//!
//! The schema is owned by the laser-control server; these bindings cover the
//! subset of unary calls the driver uses. Message types mirror the service's
//! `sepia2` package; the stub issues the same frames `tonic-build` output
//! would, without a codegen step in this repository.
//!
//! [`Sepia2Ops`] abstracts the call surface so tests can inject
//! [`MockSepia2`] instead of a live channel.

use anyhow::Result;
use async_trait::async_trait;
use lab_core::error::LabError;
use tokio::sync::Mutex;
use tonic::codegen::http;
use tonic::transport::{Channel, Endpoint};

/// Message bindings for the `sepia2` package.
pub mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Empty {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeviceIdx {
        #[prost(uint32, tag = "1")]
        pub dev_idx: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetModuleMapRequest {
        #[prost(uint32, tag = "1")]
        pub dev_idx: u32,
        #[prost(bool, tag = "2")]
        pub perform_restart: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MapIdxRequest {
        #[prost(uint32, tag = "1")]
        pub dev_idx: u32,
        #[prost(uint32, tag = "2")]
        pub map_idx: u32,
    }

    /// Addresses one PRI module (the laser head lives in slot 100).
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PriRequest {
        #[prost(uint32, tag = "1")]
        pub dev_idx: u32,
        #[prost(uint32, tag = "2")]
        pub slot_id: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct WavelengthRequest {
        #[prost(message, optional, tag = "1")]
        pub pri_req: ::core::option::Option<PriRequest>,
        #[prost(uint32, tag = "2")]
        pub wl_idx: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SetIntensityRequest {
        #[prost(message, optional, tag = "1")]
        pub wl_req: ::core::option::Option<WavelengthRequest>,
        #[prost(uint32, tag = "2")]
        pub intensity: u32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum OperationMode {
        Off = 0,
        Cw = 1,
        BroadPulse = 2,
        NarrowPulse = 3,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct OperationModeRequest {
        #[prost(message, optional, tag = "1")]
        pub pri_req: ::core::option::Option<PriRequest>,
        #[prost(enumeration = "OperationMode", tag = "2")]
        pub oper_mode_enum: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TriggerSourceRequest {
        #[prost(message, optional, tag = "1")]
        pub pri_req: ::core::option::Option<PriRequest>,
        #[prost(uint32, tag = "2")]
        pub trg_src_idx: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TriggerLevelRequest {
        #[prost(message, optional, tag = "1")]
        pub pri_req: ::core::option::Option<PriRequest>,
        #[prost(int32, tag = "2")]
        pub trg_lvl: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct VersionReply {
        #[prost(string, tag = "1")]
        pub version: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct BoolReply {
        #[prost(bool, tag = "1")]
        pub value: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct UintReply {
        #[prost(uint32, tag = "1")]
        pub value: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StringReply {
        #[prost(string, tag = "1")]
        pub value: ::prost::alloc::string::String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ModuleInfoReply {
        #[prost(uint32, tag = "1")]
        pub slot_id: u32,
        #[prost(bool, tag = "2")]
        pub is_primary: bool,
        #[prost(bool, tag = "3")]
        pub is_back_plane: bool,
        #[prost(bool, tag = "4")]
        pub has_utc: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PriDeviceInfoReply {
        #[prost(string, tag = "1")]
        pub device_id: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub device_type: ::prost::alloc::string::String,
        #[prost(string, tag = "3")]
        pub fw_version: ::prost::alloc::string::String,
        #[prost(uint32, repeated, tag = "4")]
        pub wavelengths: ::prost::alloc::vec::Vec<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FrequencyLimitsReply {
        #[prost(uint32, tag = "1")]
        pub min_freq_hz: u32,
        #[prost(uint32, tag = "2")]
        pub max_freq_hz: u32,
    }
}

/// Unary stub over a tonic channel for the `sepia2.Sepia2` service.
pub struct Sepia2Client {
    inner: tonic::client::Grpc<Channel>,
}

macro_rules! unary {
    ($self:ident, $req:expr, $method:literal) => {{
        $self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = http::uri::PathAndQuery::from_static(concat!("/sepia2.Sepia2/", $method));
        Ok($self
            .inner
            .unary(tonic::Request::new($req), path, codec)
            .await?
            .into_inner())
    }};
}

impl Sepia2Client {
    /// Connect to the laser-control server.
    ///
    /// `dst` must carry a scheme, e.g. `http://eng-7383:50051`.
    pub async fn connect(dst: String) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(dst)?.connect().await?;
        Ok(Self {
            inner: tonic::client::Grpc::new(channel),
        })
    }

    async fn ready(&mut self) -> Result<(), tonic::Status> {
        self.inner.ready().await.map_err(|e| {
            tonic::Status::new(
                tonic::Code::Unknown,
                format!("Service was not ready: {}", e),
            )
        })
    }

    pub async fn lib_get_version(
        &mut self,
        request: pb::Empty,
    ) -> Result<pb::VersionReply, tonic::Status> {
        unary!(self, request, "LIB_GetVersion")
    }

    pub async fn usb_is_open_device(
        &mut self,
        request: pb::DeviceIdx,
    ) -> Result<pb::BoolReply, tonic::Status> {
        unary!(self, request, "USB_IsOpenDevice")
    }

    pub async fn usb_open_device(
        &mut self,
        request: pb::DeviceIdx,
    ) -> Result<pb::Empty, tonic::Status> {
        unary!(self, request, "USB_OpenDevice")
    }

    pub async fn usb_get_str_descriptor(
        &mut self,
        request: pb::DeviceIdx,
    ) -> Result<pb::StringReply, tonic::Status> {
        unary!(self, request, "USB_GetStrDescriptor")
    }

    pub async fn fwr_get_version(
        &mut self,
        request: pb::DeviceIdx,
    ) -> Result<pb::StringReply, tonic::Status> {
        unary!(self, request, "FWR_GetVersion")
    }

    pub async fn fwr_get_module_map(
        &mut self,
        request: pb::GetModuleMapRequest,
    ) -> Result<pb::UintReply, tonic::Status> {
        unary!(self, request, "FWR_GetModuleMap")
    }

    pub async fn fwr_get_module_info_by_map_idx(
        &mut self,
        request: pb::MapIdxRequest,
    ) -> Result<pb::ModuleInfoReply, tonic::Status> {
        unary!(self, request, "FWR_GetModuleInfoByMapIdx")
    }

    pub async fn pri_get_device_info(
        &mut self,
        request: pb::PriRequest,
    ) -> Result<pb::PriDeviceInfoReply, tonic::Status> {
        unary!(self, request, "PRI_GetDeviceInfo")
    }

    pub async fn pri_get_frequency_limits(
        &mut self,
        request: pb::PriRequest,
    ) -> Result<pb::FrequencyLimitsReply, tonic::Status> {
        unary!(self, request, "PRI_GetFrequencyLimits")
    }

    pub async fn pri_set_wavelength_idx(
        &mut self,
        request: pb::WavelengthRequest,
    ) -> Result<pb::Empty, tonic::Status> {
        unary!(self, request, "PRI_SetWavelengthIdx")
    }

    pub async fn pri_set_intensity(
        &mut self,
        request: pb::SetIntensityRequest,
    ) -> Result<pb::Empty, tonic::Status> {
        unary!(self, request, "PRI_SetIntensity")
    }

    pub async fn pri_set_operation_mode(
        &mut self,
        request: pb::OperationModeRequest,
    ) -> Result<pb::Empty, tonic::Status> {
        unary!(self, request, "PRI_SetOperationMode")
    }

    pub async fn pri_set_trigger_source(
        &mut self,
        request: pb::TriggerSourceRequest,
    ) -> Result<pb::Empty, tonic::Status> {
        unary!(self, request, "PRI_SetTriggerSource")
    }

    pub async fn pri_set_trigger_level(
        &mut self,
        request: pb::TriggerLevelRequest,
    ) -> Result<pb::Empty, tonic::Status> {
        unary!(self, request, "PRI_SetTriggerLevel")
    }
}

// =============================================================================
// Call-surface abstraction (allows mock injection)
// =============================================================================

/// The service calls the driver makes, with request plumbing folded away.
#[async_trait]
pub trait Sepia2Ops: Send + Sync {
    async fn lib_version(&self) -> Result<String>;
    async fn usb_is_open(&self, dev_idx: u32) -> Result<bool>;
    async fn usb_open(&self, dev_idx: u32) -> Result<()>;
    async fn usb_descriptor(&self, dev_idx: u32) -> Result<String>;
    async fn fwr_version(&self, dev_idx: u32) -> Result<String>;
    async fn fwr_module_map(&self, dev_idx: u32, perform_restart: bool) -> Result<u32>;
    async fn fwr_module_info(&self, dev_idx: u32, map_idx: u32) -> Result<pb::ModuleInfoReply>;
    async fn pri_device_info(&self, pri: &pb::PriRequest) -> Result<pb::PriDeviceInfoReply>;
    async fn pri_frequency_limits(&self, pri: &pb::PriRequest) -> Result<(u32, u32)>;
    async fn pri_set_wavelength_idx(&self, pri: &pb::PriRequest, wl_idx: u32) -> Result<()>;
    async fn pri_set_intensity(&self, pri: &pb::PriRequest, wl_idx: u32, per_mille: u16)
        -> Result<()>;
    async fn pri_set_operation_mode(
        &self,
        pri: &pb::PriRequest,
        mode: pb::OperationMode,
    ) -> Result<()>;
    async fn pri_set_trigger_source(&self, pri: &pb::PriRequest, trg_src_idx: u32) -> Result<()>;
    async fn pri_set_trigger_level(&self, pri: &pb::PriRequest, trg_lvl_mv: i32) -> Result<()>;
}

fn rpc_err(status: tonic::Status) -> anyhow::Error {
    LabError::Rpc(status.to_string()).into()
}

/// Live implementation over a tonic channel.
pub struct GrpcSepia2 {
    client: Mutex<Sepia2Client>,
}

impl GrpcSepia2 {
    /// Connect to the laser-control server at `address` (host:port, scheme
    /// optional).
    pub async fn connect(address: &str) -> Result<Self> {
        let dst = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        let client = Sepia2Client::connect(dst.clone())
            .await
            .map_err(|e| LabError::DeviceUnreachable {
                device: "Sepia2 laser server".into(),
                message: format!("{}: {}", dst, e),
            })?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

#[async_trait]
impl Sepia2Ops for GrpcSepia2 {
    async fn lib_version(&self) -> Result<String> {
        let mut client = self.client.lock().await;
        let reply = client.lib_get_version(pb::Empty {}).await.map_err(rpc_err)?;
        Ok(reply.version)
    }

    async fn usb_is_open(&self, dev_idx: u32) -> Result<bool> {
        let mut client = self.client.lock().await;
        let reply = client
            .usb_is_open_device(pb::DeviceIdx { dev_idx })
            .await
            .map_err(rpc_err)?;
        Ok(reply.value)
    }

    async fn usb_open(&self, dev_idx: u32) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .usb_open_device(pb::DeviceIdx { dev_idx })
            .await
            .map_err(rpc_err)?;
        Ok(())
    }

    async fn usb_descriptor(&self, dev_idx: u32) -> Result<String> {
        let mut client = self.client.lock().await;
        let reply = client
            .usb_get_str_descriptor(pb::DeviceIdx { dev_idx })
            .await
            .map_err(rpc_err)?;
        Ok(reply.value)
    }

    async fn fwr_version(&self, dev_idx: u32) -> Result<String> {
        let mut client = self.client.lock().await;
        let reply = client
            .fwr_get_version(pb::DeviceIdx { dev_idx })
            .await
            .map_err(rpc_err)?;
        Ok(reply.value)
    }

    async fn fwr_module_map(&self, dev_idx: u32, perform_restart: bool) -> Result<u32> {
        let mut client = self.client.lock().await;
        let reply = client
            .fwr_get_module_map(pb::GetModuleMapRequest {
                dev_idx,
                perform_restart,
            })
            .await
            .map_err(rpc_err)?;
        Ok(reply.value)
    }

    async fn fwr_module_info(&self, dev_idx: u32, map_idx: u32) -> Result<pb::ModuleInfoReply> {
        let mut client = self.client.lock().await;
        client
            .fwr_get_module_info_by_map_idx(pb::MapIdxRequest { dev_idx, map_idx })
            .await
            .map_err(rpc_err)
    }

    async fn pri_device_info(&self, pri: &pb::PriRequest) -> Result<pb::PriDeviceInfoReply> {
        let mut client = self.client.lock().await;
        client
            .pri_get_device_info(pri.clone())
            .await
            .map_err(rpc_err)
    }

    async fn pri_frequency_limits(&self, pri: &pb::PriRequest) -> Result<(u32, u32)> {
        let mut client = self.client.lock().await;
        let reply = client
            .pri_get_frequency_limits(pri.clone())
            .await
            .map_err(rpc_err)?;
        Ok((reply.min_freq_hz, reply.max_freq_hz))
    }

    async fn pri_set_wavelength_idx(&self, pri: &pb::PriRequest, wl_idx: u32) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .pri_set_wavelength_idx(pb::WavelengthRequest {
                pri_req: Some(pri.clone()),
                wl_idx,
            })
            .await
            .map_err(rpc_err)?;
        Ok(())
    }

    async fn pri_set_intensity(
        &self,
        pri: &pb::PriRequest,
        wl_idx: u32,
        per_mille: u16,
    ) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .pri_set_intensity(pb::SetIntensityRequest {
                wl_req: Some(pb::WavelengthRequest {
                    pri_req: Some(pri.clone()),
                    wl_idx,
                }),
                intensity: u32::from(per_mille),
            })
            .await
            .map_err(rpc_err)?;
        Ok(())
    }

    async fn pri_set_operation_mode(
        &self,
        pri: &pb::PriRequest,
        mode: pb::OperationMode,
    ) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .pri_set_operation_mode(pb::OperationModeRequest {
                pri_req: Some(pri.clone()),
                oper_mode_enum: mode as i32,
            })
            .await
            .map_err(rpc_err)?;
        Ok(())
    }

    async fn pri_set_trigger_source(&self, pri: &pb::PriRequest, trg_src_idx: u32) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .pri_set_trigger_source(pb::TriggerSourceRequest {
                pri_req: Some(pri.clone()),
                trg_src_idx,
            })
            .await
            .map_err(rpc_err)?;
        Ok(())
    }

    async fn pri_set_trigger_level(&self, pri: &pb::PriRequest, trg_lvl_mv: i32) -> Result<()> {
        let mut client = self.client.lock().await;
        client
            .pri_set_trigger_level(pb::TriggerLevelRequest {
                pri_req: Some(pri.clone()),
                trg_lvl: trg_lvl_mv,
            })
            .await
            .map_err(rpc_err)?;
        Ok(())
    }
}

// =============================================================================
// Mock service (tests and offline bring-up)
// =============================================================================

/// In-memory laser state mimicking the Sepia2 service.
#[derive(Debug, Clone, PartialEq)]
pub struct MockLaserState {
    pub usb_open: bool,
    pub wl_idx: u32,
    pub intensity_per_mille: u16,
    pub mode: pb::OperationMode,
    pub trigger_source_idx: u32,
    pub trigger_level_mv: i32,
}

impl Default for MockLaserState {
    fn default() -> Self {
        Self {
            usb_open: false,
            wl_idx: 0,
            intensity_per_mille: 0,
            mode: pb::OperationMode::Off,
            trigger_source_idx: 0,
            trigger_level_mv: 0,
        }
    }
}

/// Mock Sepia2 service for testing without the laser-control server.
#[derive(Default)]
pub struct MockSepia2 {
    state: std::sync::Mutex<MockLaserState>,
}

impl MockSepia2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the simulated hardware state.
    pub fn state(&self) -> MockLaserState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockLaserState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

#[async_trait]
impl Sepia2Ops for MockSepia2 {
    async fn lib_version(&self) -> Result<String> {
        Ok("1.2.0-mock".to_string())
    }

    async fn usb_is_open(&self, _dev_idx: u32) -> Result<bool> {
        Ok(self.with_state(|s| s.usb_open))
    }

    async fn usb_open(&self, _dev_idx: u32) -> Result<()> {
        self.with_state(|s| s.usb_open = true);
        Ok(())
    }

    async fn usb_descriptor(&self, _dev_idx: u32) -> Result<String> {
        Ok("Prima (mock)".to_string())
    }

    async fn fwr_version(&self, _dev_idx: u32) -> Result<String> {
        Ok("1.05.482".to_string())
    }

    async fn fwr_module_map(&self, _dev_idx: u32, _perform_restart: bool) -> Result<u32> {
        Ok(1)
    }

    async fn fwr_module_info(&self, _dev_idx: u32, map_idx: u32) -> Result<pb::ModuleInfoReply> {
        if map_idx > 0 {
            return Err(LabError::Rpc(format!("no module at map index {}", map_idx)).into());
        }
        Ok(pb::ModuleInfoReply {
            slot_id: 100,
            is_primary: true,
            is_back_plane: false,
            has_utc: false,
        })
    }

    async fn pri_device_info(&self, _pri: &pb::PriRequest) -> Result<pb::PriDeviceInfoReply> {
        Ok(pb::PriDeviceInfoReply {
            device_id: "Prima-Mock-000".into(),
            device_type: "Prima".into(),
            fw_version: "1.05.482".into(),
            wavelengths: vec![450, 515, 640],
        })
    }

    async fn pri_frequency_limits(&self, _pri: &pb::PriRequest) -> Result<(u32, u32)> {
        Ok((1_000, 100_000_000))
    }

    async fn pri_set_wavelength_idx(&self, _pri: &pb::PriRequest, wl_idx: u32) -> Result<()> {
        if wl_idx > 2 {
            return Err(LabError::Rpc(format!("invalid wavelength index {}", wl_idx)).into());
        }
        self.with_state(|s| s.wl_idx = wl_idx);
        Ok(())
    }

    async fn pri_set_intensity(
        &self,
        _pri: &pb::PriRequest,
        wl_idx: u32,
        per_mille: u16,
    ) -> Result<()> {
        if per_mille > 1000 {
            return Err(LabError::Rpc(format!("intensity {} out of range", per_mille)).into());
        }
        self.with_state(|s| {
            s.wl_idx = wl_idx;
            s.intensity_per_mille = per_mille;
        });
        Ok(())
    }

    async fn pri_set_operation_mode(
        &self,
        _pri: &pb::PriRequest,
        mode: pb::OperationMode,
    ) -> Result<()> {
        self.with_state(|s| s.mode = mode);
        Ok(())
    }

    async fn pri_set_trigger_source(&self, _pri: &pb::PriRequest, trg_src_idx: u32) -> Result<()> {
        self.with_state(|s| s.trigger_source_idx = trg_src_idx);
        Ok(())
    }

    async fn pri_set_trigger_level(&self, _pri: &pb::PriRequest, trg_lvl_mv: i32) -> Result<()> {
        self.with_state(|s| s.trigger_level_mv = trg_lvl_mv);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_nested_request_roundtrip() {
        let req = pb::SetIntensityRequest {
            wl_req: Some(pb::WavelengthRequest {
                pri_req: Some(pb::PriRequest {
                    dev_idx: 0,
                    slot_id: 100,
                }),
                wl_idx: 2,
            }),
            intensity: 350,
        };

        let bytes = req.encode_to_vec();
        let decoded = pb::SetIntensityRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn test_operation_mode_enumeration() {
        assert_eq!(pb::OperationMode::NarrowPulse as i32, 3);
        assert_eq!(
            pb::OperationMode::try_from(2).unwrap(),
            pb::OperationMode::BroadPulse
        );
        assert!(pb::OperationMode::try_from(42).is_err());
    }

    #[tokio::test]
    async fn test_mock_tracks_state() {
        let mock = MockSepia2::new();
        let pri = pb::PriRequest {
            dev_idx: 0,
            slot_id: 100,
        };

        assert!(!mock.usb_is_open(0).await.unwrap());
        mock.usb_open(0).await.unwrap();
        assert!(mock.usb_is_open(0).await.unwrap());

        mock.pri_set_intensity(&pri, 2, 500).await.unwrap();
        let state = mock.state();
        assert_eq!(state.wl_idx, 2);
        assert_eq!(state.intensity_per_mille, 500);

        assert!(mock.pri_set_intensity(&pri, 2, 1500).await.is_err());
        assert!(mock.pri_set_wavelength_idx(&pri, 7).await.is_err());
    }
}
