use aero_wire_protocol::cmd::FenceOnCompletion;
use aero_wire_protocol::{CommandSerializer, ObjectType, RequestStatus, WireError};

use crate::client::{live, Client};
use crate::objects::{Fence, WireObject};
use crate::requests::PendingRequest;

impl<S: CommandSerializer> Client<S> {
    /// Resolves once the fence reaches `value`. Already-reached values still
    /// make a round trip so callbacks keep their order.
    pub fn fence_on_completion(
        &mut self,
        fence: Fence,
        value: u64,
        callback: impl FnOnce(RequestStatus) + 'static,
    ) -> Result<(), WireError> {
        if self.is_disconnected() {
            callback(RequestStatus::Disconnected);
            return Ok(());
        }
        let Some(proxy) = self.fences.get_mut(fence.handle()) else {
            callback(RequestStatus::Error);
            return Ok(());
        };
        let request_serial = proxy
            .requests
            .issue(PendingRequest::FenceCompletion(Box::new(callback)));
        self.serialize(
            &FenceOnCompletion {
                fence: fence.handle(),
                value,
                request_serial,
            },
            &[],
        )
    }

    /// Highest value the server has reported as completed.
    pub fn fence_completed_value(&self, fence: Fence) -> Result<u64, WireError> {
        Ok(live(&self.fences, ObjectType::Fence, fence.handle())?
            .inner
            .completed_value)
    }
}
