#![no_main]

use aero_wire_protocol::{CommandHandler, MemoryTransport, ObjectHandle};
use aero_wire_server::{NullBackend, NullDevice, Server};
use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    // Split points let the reassembly path see commands cut anywhere.
    let pieces: u8 = u.int_in_range(1..=8).unwrap_or(1);
    let rest_len = u.len();
    let stream = u.bytes(rest_len).unwrap_or(&[]);

    let mut server = Server::new(NullBackend::new(), MemoryTransport::new(4096));
    if server
        .inject_device(ObjectHandle::new(1, 1), NullDevice::new())
        .is_err()
    {
        return;
    }

    let step = (stream.len() / pieces as usize).max(1);
    for chunk in stream.chunks(step) {
        // Errors are expected; the oracle is "must not panic" and "fatal
        // errors stay fatal".
        if server.handle_commands(chunk).is_err() && server.is_disconnected() {
            assert!(server.handle_commands(&[]).is_err());
            return;
        }
        let _ = server.tick();
        let _ = server.transport_mut().take_flushed();
    }
});
