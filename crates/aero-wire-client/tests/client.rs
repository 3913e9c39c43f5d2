use std::cell::RefCell;
use std::rc::Rc;

use aero_wire_client::{Buffer, BufferMapState, Client, Device, Queue, WireObject};
use aero_wire_protocol::cmd::{
    encode_to_vec, BufferMapAsyncCallback, DeviceLostCallback, FenceOnCompletionCallback,
    QueueWorkDoneCallback,
};
use aero_wire_protocol::{
    BufferDescriptor, BufferUsages, ChunkedCommandHandler, CommandHandler, DeviceLostReason,
    MapMode, MemoryTransport, ObjectHandle, RequestStatus, WireCmd, WireError,
};
use pretty_assertions::assert_eq;

type Log = Rc<RefCell<Vec<(&'static str, RequestStatus)>>>;

fn client() -> Client<MemoryTransport> {
    Client::new(MemoryTransport::new(1024))
}

fn recorder(log: &Log, tag: &'static str) -> impl FnOnce(RequestStatus) + 'static {
    let log = log.clone();
    move |status| log.borrow_mut().push((tag, status))
}

/// Names and handles of every command the client has flushed so far.
fn sent(client: &mut Client<MemoryTransport>) -> Vec<String> {
    client.flush().unwrap();
    let bytes = client.transport_mut().take_flushed();
    let mut names = Vec::new();
    ChunkedCommandHandler::new()
        .handle_bytes(&bytes, |header, body| {
            let cmd = WireCmd::decode(header.command_id, body)?;
            names.push(match cmd {
                WireCmd::DestroyObject(cmd, _) => format!(
                    "DestroyObject({}, {})",
                    cmd.object_type, cmd.handle
                ),
                other => other.name().to_owned(),
            });
            Ok(())
        })
        .unwrap();
    names
}

fn device_with_queue(client: &mut Client<MemoryTransport>) -> (Device, Queue) {
    let device = client.reserve_device().unwrap();
    let queue = client.device_get_queue(device).unwrap();
    (device, queue)
}

fn mappable(client: &mut Client<MemoryTransport>, device: Device, usage: BufferUsages) -> Buffer {
    client
        .device_create_buffer(
            device,
            &BufferDescriptor {
                size: 16,
                usage,
                mapped_at_creation: false,
            },
        )
        .unwrap()
}

#[test]
fn destroying_a_device_resolves_child_requests_and_invalidates_handles() {
    let mut client = client();
    let device = client.reserve_device().unwrap();
    assert_eq!(device.handle(), ObjectHandle::new(1, 1));
    let _first = client.device_get_queue(device).unwrap();
    let queue = client.device_get_queue(device).unwrap();
    assert_eq!(queue.handle(), ObjectHandle::new(2, 1));

    let log: Log = Default::default();
    for _ in 0..7 {
        client
            .queue_on_submitted_work_done(queue, recorder(&log, "work"))
            .unwrap();
    }
    assert_eq!(client.pending_request_count(queue), 7);

    client.release(device).unwrap();

    assert_eq!(*log.borrow(), vec![("work", RequestStatus::DeviceLost); 7]);
    assert!(!client.is_alive(queue));
    assert!(!client.is_alive(device));

    // A late reply for serial 7 against the stale handle is ignored.
    let late = encode_to_vec(
        &QueueWorkDoneCallback {
            queue: queue.handle(),
            request_serial: 7,
            status: RequestStatus::Success.to_u32(),
        },
        &[],
    );
    client.handle_commands(&late).unwrap();
    assert_eq!(log.borrow().len(), 7);

    let device = client.reserve_device().unwrap();
    let reused = client.device_get_queue(device).unwrap();
    assert_eq!(reused.handle(), ObjectHandle::new(2, 2));
    assert!(client.is_alive(reused));
    assert!(!client.is_alive(queue));
}

#[test]
fn cascade_resolves_every_request_once_and_sends_destroys_children_first() {
    let mut client = client();
    let (device, queue) = device_with_queue(&mut client);
    let buffer = mappable(&mut client, device, BufferUsages::MAP_READ);
    let module = client
        .device_create_shader_module(device, "@compute fn main() {}")
        .unwrap();
    let fence = client.queue_create_fence(queue, 0).unwrap();
    sent(&mut client);

    let log: Log = Default::default();
    client
        .buffer_map_async(buffer, MapMode::READ, 0, 16, recorder(&log, "map"))
        .unwrap();
    client
        .fence_on_completion(fence, 3, recorder(&log, "fence"))
        .unwrap();
    client
        .queue_on_submitted_work_done(queue, recorder(&log, "work"))
        .unwrap();
    {
        let log = log.clone();
        client
            .shader_module_get_compilation_info(module, move |status, _| {
                log.borrow_mut().push(("info", status))
            })
            .unwrap();
    }
    let lost = Rc::new(RefCell::new(None));
    {
        let lost = lost.clone();
        client
            .device_set_device_lost_callback(device, move |reason, _| {
                *lost.borrow_mut() = Some(reason)
            })
            .unwrap();
    }
    sent(&mut client);

    client.release(device).unwrap();

    let mut seen = log.borrow().clone();
    seen.sort_by_key(|(tag, _)| *tag);
    assert_eq!(
        seen,
        vec![
            ("fence", RequestStatus::DeviceLost),
            ("info", RequestStatus::DeviceLost),
            ("map", RequestStatus::DeviceLost),
            ("work", RequestStatus::DeviceLost),
        ]
    );
    assert_eq!(*lost.borrow(), Some(DeviceLostReason::Destroyed));
    for alive in [
        client.is_alive(queue),
        client.is_alive(buffer),
        client.is_alive(module),
        client.is_alive(fence),
    ] {
        assert!(!alive);
    }
    assert_eq!(
        sent(&mut client),
        vec![
            "DestroyObject(6, (1, 1))",
            "DestroyObject(3, (1, 1))",
            "DestroyObject(2, (1, 1))",
            "DestroyObject(1, (1, 1))",
            "DestroyObject(0, (1, 1))",
        ]
    );
}

#[test]
fn release_counts_references() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let buffer = mappable(&mut client, device, BufferUsages::MAP_READ);
    client.reference(buffer).unwrap();

    let log: Log = Default::default();
    client
        .buffer_map_async(buffer, MapMode::READ, 0, 16, recorder(&log, "map"))
        .unwrap();

    client.release(buffer).unwrap();
    assert!(client.is_alive(buffer));
    assert!(log.borrow().is_empty());

    client.release(buffer).unwrap();
    assert!(!client.is_alive(buffer));
    assert_eq!(
        *log.borrow(),
        vec![("map", RequestStatus::DestroyedBeforeCallback)]
    );
    assert!(matches!(
        client.release(buffer),
        Err(WireError::Validation(_))
    ));
}

#[test]
fn disconnect_resolves_everything_and_short_circuits_later_calls() {
    let mut client = client();
    let (device, queue) = device_with_queue(&mut client);
    let log: Log = Default::default();
    client
        .queue_on_submitted_work_done(queue, recorder(&log, "before"))
        .unwrap();
    let lost = Rc::new(RefCell::new(Vec::new()));
    {
        let lost = lost.clone();
        client
            .device_set_device_lost_callback(device, move |reason, _| {
                lost.borrow_mut().push(reason)
            })
            .unwrap();
    }
    sent(&mut client);

    // A reply naming a queue the client never created is fatal.
    let bogus = encode_to_vec(
        &QueueWorkDoneCallback {
            queue: ObjectHandle::new(40, 1),
            request_serial: 1,
            status: 0,
        },
        &[],
    );
    assert!(matches!(
        client.handle_commands(&bogus),
        Err(WireError::UnknownObject { .. })
    ));
    assert!(client.is_disconnected());
    assert_eq!(*log.borrow(), vec![("before", RequestStatus::Disconnected)]);
    assert_eq!(*lost.borrow(), vec![DeviceLostReason::ConnectionLost]);

    client.disconnect();
    assert_eq!(lost.borrow().len(), 1);

    client
        .queue_on_submitted_work_done(queue, recorder(&log, "after"))
        .unwrap();
    assert_eq!(log.borrow()[1], ("after", RequestStatus::Disconnected));
    assert!(matches!(
        client.device_create_command_encoder(device),
        Err(WireError::Disconnected)
    ));
    assert!(matches!(
        client.handle_commands(&bogus),
        Err(WireError::Disconnected)
    ));
    assert!(matches!(client.flush(), Err(WireError::Disconnected)));
    assert!(client.transport_mut().take_flushed().is_empty());
    // Tables are left as they were.
    assert!(client.is_alive(queue));
}

#[test]
fn map_read_round_trip() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let buffer = mappable(&mut client, device, BufferUsages::MAP_READ);
    let log: Log = Default::default();
    client
        .buffer_map_async(buffer, MapMode::READ, 8, 8, recorder(&log, "map"))
        .unwrap();
    assert_eq!(client.buffer_map_state(buffer).unwrap(), BufferMapState::Pending);

    let reply = encode_to_vec(
        &BufferMapAsyncCallback {
            buffer: buffer.handle(),
            request_serial: 1,
            status: RequestStatus::Success.to_u32(),
            data_len: 8,
        },
        &[1, 2, 3, 4, 5, 6, 7, 8],
    );
    client.handle_commands(&reply).unwrap();

    assert_eq!(*log.borrow(), vec![("map", RequestStatus::Success)]);
    assert_eq!(
        client.buffer_get_mapped_range(buffer).unwrap(),
        &[1, 2, 3, 4, 5, 6, 7, 8][..]
    );
    assert!(matches!(
        client.buffer_get_mapped_range_mut(buffer),
        Err(WireError::Validation(_))
    ));

    client.buffer_unmap(buffer).unwrap();
    assert_eq!(client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);
    let names = sent(&mut client);
    assert_eq!(names.last().map(String::as_str), Some("BufferUnmap"));
    assert!(!names.iter().any(|n| n == "BufferUpdateMappedData"));
}

#[test]
fn unmap_cancels_a_pending_map_and_ignores_the_late_reply() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let buffer = mappable(&mut client, device, BufferUsages::MAP_WRITE);
    let log: Log = Default::default();
    client
        .buffer_map_async(buffer, MapMode::WRITE, 0, 16, recorder(&log, "map"))
        .unwrap();
    client.buffer_unmap(buffer).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![("map", RequestStatus::UnmappedBeforeCallback)]
    );

    let reply = encode_to_vec(
        &BufferMapAsyncCallback {
            buffer: buffer.handle(),
            request_serial: 1,
            status: RequestStatus::Success.to_u32(),
            data_len: 16,
        },
        &[0; 16],
    );
    client.handle_commands(&reply).unwrap();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);
}

#[test]
fn invalid_map_requests_fail_through_the_callback() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let buffer = mappable(&mut client, device, BufferUsages::MAP_READ);
    sent(&mut client);

    let log: Log = Default::default();
    client
        .buffer_map_async(buffer, MapMode::WRITE, 0, 16, recorder(&log, "usage"))
        .unwrap();
    client
        .buffer_map_async(buffer, MapMode::READ, 0, 32, recorder(&log, "range"))
        .unwrap();
    assert_eq!(
        *log.borrow(),
        vec![
            ("usage", RequestStatus::Error),
            ("range", RequestStatus::Error)
        ]
    );
    assert!(sent(&mut client).is_empty());
    assert!(!client.is_disconnected());
}

#[test]
fn mapped_at_creation_writes_back_on_unmap() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let buffer = client
        .device_create_buffer(
            device,
            &BufferDescriptor {
                size: 8,
                usage: BufferUsages::COPY_SRC,
                mapped_at_creation: true,
            },
        )
        .unwrap();
    client
        .buffer_get_mapped_range_mut(buffer)
        .unwrap()
        .copy_from_slice(b"aerowire");
    sent(&mut client);

    client.buffer_unmap(buffer).unwrap();
    assert_eq!(sent(&mut client), vec!["BufferUpdateMappedData", "BufferUnmap"]);

    assert!(matches!(
        client.device_create_buffer(
            device,
            &BufferDescriptor {
                size: 6,
                usage: BufferUsages::COPY_SRC,
                mapped_at_creation: true,
            },
        ),
        Err(WireError::Validation(_))
    ));
}

#[test]
fn destroying_a_buffer_cancels_its_map_and_rejects_later_ones() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let buffer = mappable(&mut client, device, BufferUsages::MAP_READ);
    sent(&mut client);

    let log: Log = Default::default();
    client
        .buffer_map_async(buffer, MapMode::READ, 0, 16, recorder(&log, "map"))
        .unwrap();
    client.buffer_destroy(buffer).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![("map", RequestStatus::DestroyedBeforeCallback)]
    );
    assert_eq!(sent(&mut client), vec!["BufferMapAsync", "BufferDestroy"]);

    let reply = encode_to_vec(
        &BufferMapAsyncCallback {
            buffer: buffer.handle(),
            request_serial: 1,
            status: RequestStatus::Success.to_u32(),
            data_len: 16,
        },
        &[0; 16],
    );
    client.handle_commands(&reply).unwrap();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);

    // The handle stays valid but every map fails.
    assert!(client.is_alive(buffer));
    client
        .buffer_map_async(buffer, MapMode::READ, 0, 16, recorder(&log, "again"))
        .unwrap();
    assert_eq!(log.borrow()[1], ("again", RequestStatus::Error));
    assert!(sent(&mut client).is_empty());
}

#[test]
fn destroying_a_buffer_drops_its_unwritten_mapping() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let buffer = client
        .device_create_buffer(
            device,
            &BufferDescriptor {
                size: 8,
                usage: BufferUsages::COPY_SRC,
                mapped_at_creation: true,
            },
        )
        .unwrap();
    sent(&mut client);

    client.buffer_destroy(buffer).unwrap();
    assert_eq!(client.buffer_map_state(buffer).unwrap(), BufferMapState::Unmapped);
    assert!(client.buffer_get_mapped_range(buffer).is_err());
    assert_eq!(sent(&mut client), vec!["BufferDestroy"]);
}

#[test]
fn destroying_a_device_cancels_child_maps_and_reports_the_loss_once() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let buffer = mappable(&mut client, device, BufferUsages::MAP_READ);
    let lost = Rc::new(RefCell::new(Vec::new()));
    {
        let lost = lost.clone();
        client
            .device_set_device_lost_callback(device, move |reason, _: &str| {
                lost.borrow_mut().push(reason)
            })
            .unwrap();
    }
    let log: Log = Default::default();
    client
        .buffer_map_async(buffer, MapMode::READ, 0, 16, recorder(&log, "map"))
        .unwrap();
    sent(&mut client);

    client.device_destroy(device).unwrap();
    assert_eq!(
        *log.borrow(),
        vec![("map", RequestStatus::DestroyedBeforeCallback)]
    );
    assert_eq!(*lost.borrow(), vec![DeviceLostReason::Destroyed]);
    assert_eq!(sent(&mut client), vec!["DeviceDestroy"]);
    assert!(client.is_alive(device));
    assert!(client.is_alive(buffer));

    client.release(device).unwrap();
    assert_eq!(*lost.borrow(), vec![DeviceLostReason::Destroyed]);
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn fence_completion_updates_the_completed_value() {
    let mut client = client();
    let (_, queue) = device_with_queue(&mut client);
    let fence = client.queue_create_fence(queue, 1).unwrap();
    assert_eq!(client.fence_completed_value(fence).unwrap(), 1);

    let log: Log = Default::default();
    client
        .fence_on_completion(fence, 5, recorder(&log, "fence"))
        .unwrap();
    let reply = encode_to_vec(
        &FenceOnCompletionCallback {
            fence: fence.handle(),
            request_serial: 1,
            status: RequestStatus::Success.to_u32(),
            completed_value: 5,
        },
        &[],
    );
    client.handle_commands(&reply).unwrap();
    assert_eq!(*log.borrow(), vec![("fence", RequestStatus::Success)]);
    assert_eq!(client.fence_completed_value(fence).unwrap(), 5);
}

#[test]
fn server_reported_device_loss_fires_once() {
    let mut client = client();
    let (device, _) = device_with_queue(&mut client);
    let lost = Rc::new(RefCell::new(Vec::new()));
    {
        let lost = lost.clone();
        client
            .device_set_device_lost_callback(device, move |reason, message: &str| {
                lost.borrow_mut().push((reason, message.to_owned()))
            })
            .unwrap();
    }
    let message = b"adapter reset";
    let reply = encode_to_vec(
        &DeviceLostCallback {
            device: device.handle(),
            reason: DeviceLostReason::Unknown.to_u32(),
            message_len: message.len() as u64,
        },
        message,
    );
    client.handle_commands(&reply).unwrap();
    client.handle_commands(&reply).unwrap();
    client.release(device).unwrap();

    assert_eq!(
        *lost.borrow(),
        vec![(DeviceLostReason::Unknown, "adapter reset".to_owned())]
    );
}

#[test]
fn replies_may_arrive_in_arbitrary_pieces() {
    let mut client = client();
    let (_, queue) = device_with_queue(&mut client);
    let log: Log = Default::default();
    for tag in ["a", "b"] {
        client
            .queue_on_submitted_work_done(queue, recorder(&log, tag))
            .unwrap();
    }
    let mut stream = Vec::new();
    for serial in [2, 1] {
        stream.extend(encode_to_vec(
            &QueueWorkDoneCallback {
                queue: queue.handle(),
                request_serial: serial,
                status: RequestStatus::Success.to_u32(),
            },
            &[],
        ));
    }
    for piece in stream.chunks(5) {
        client.handle_commands(piece).unwrap();
    }
    assert_eq!(
        *log.borrow(),
        vec![("b", RequestStatus::Success), ("a", RequestStatus::Success)]
    );
}
