use aero_wire_protocol::cmd::ShaderModuleGetCompilationInfo;
use aero_wire_protocol::{CommandSerializer, CompilationMessage, RequestStatus, WireError};

use crate::client::Client;
use crate::objects::{ShaderModule, WireObject};
use crate::requests::PendingRequest;

impl<S: CommandSerializer> Client<S> {
    pub fn shader_module_get_compilation_info(
        &mut self,
        shader_module: ShaderModule,
        callback: impl FnOnce(RequestStatus, &[CompilationMessage]) + 'static,
    ) -> Result<(), WireError> {
        if self.is_disconnected() {
            callback(RequestStatus::Disconnected, &[]);
            return Ok(());
        }
        let Some(proxy) = self.shader_modules.get_mut(shader_module.handle()) else {
            callback(RequestStatus::Error, &[]);
            return Ok(());
        };
        let request_serial = proxy
            .requests
            .issue(PendingRequest::CompilationInfo(Box::new(callback)));
        self.serialize(
            &ShaderModuleGetCompilationInfo {
                shader_module: shader_module.handle(),
                request_serial,
            },
            &[],
        )
    }
}
