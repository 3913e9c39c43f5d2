#![no_main]

use aero_wire_client::Client;
use aero_wire_protocol::{CommandHandler, MemoryTransport, RequestStatus};
use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let write_at_creation: bool = u.arbitrary().unwrap_or(false);
    let rest_len = u.len();
    let stream = u.bytes(rest_len).unwrap_or(&[]);

    // A small object population so return commands have live, stale and
    // unknown targets to hit.
    let mut client = Client::new(MemoryTransport::new(1024));
    let Ok(device) = client.reserve_device() else {
        return;
    };
    let Ok(queue) = client.device_get_queue(device) else {
        return;
    };
    let desc = aero_wire_protocol::BufferDescriptor {
        size: 16,
        usage: aero_wire_protocol::BufferUsages::MAP_READ,
        mapped_at_creation: write_at_creation,
    };
    let Ok(buffer) = client.device_create_buffer(device, &desc) else {
        return;
    };
    if write_at_creation {
        let _ = client.buffer_unmap(buffer);
    }
    let _ = client.buffer_map_async(buffer, aero_wire_protocol::MapMode::READ, 0, 16, |_| {});
    for _ in 0..3 {
        let _ = client.queue_on_submitted_work_done(queue, |_: RequestStatus| {});
    }
    if let Ok(fence) = client.queue_create_fence(queue, 0) {
        let _ = client.fence_on_completion(fence, 1, |_| {});
        let _ = client.release(fence);
    }

    let _ = client.handle_commands(stream);
    client.disconnect();
    assert!(client.is_disconnected());
});
