use aero_wire_protocol::cmd::{
    encode_to_vec, BufferDestroy, BufferMapAsync, BufferUnmap, BufferUpdateMappedData,
    DestroyObject, DeviceCreateBuffer, DeviceCreateShaderModule, DeviceDestroy, DeviceGetQueue,
    QueueOnSubmittedWorkDone, QueueWriteBuffer, ShaderModuleGetCompilationInfo,
};
use aero_wire_protocol::types::decode_compilation_messages;
use aero_wire_protocol::{
    BufferUsages, ChunkedCommandHandler, CommandHandler, CompilationMessageType, MapMode,
    MemoryTransport, ObjectHandle, ObjectType, RequestStatus, ReturnWireCmd, WireError,
};
use aero_wire_server::{NullBackend, NullDevice, Server};
use pretty_assertions::assert_eq;

const DEVICE: ObjectHandle = ObjectHandle::new(1, 1);
const QUEUE: ObjectHandle = ObjectHandle::new(1, 1);

#[derive(Debug, PartialEq)]
enum Reply {
    Map(u64, RequestStatus, Vec<u8>),
    Work(u64, RequestStatus),
    Info(RequestStatus, Vec<CompilationMessageType>),
    Lost(String),
    Other(&'static str),
}

fn server() -> (Server<NullBackend, MemoryTransport>, NullDevice) {
    let mut server = Server::new(NullBackend::new(), MemoryTransport::new(4096));
    let device = NullDevice::new();
    server.inject_device(DEVICE, device.clone()).unwrap();
    let get_queue = encode_to_vec(
        &DeviceGetQueue {
            device: DEVICE,
            result: QUEUE,
        },
        &[],
    );
    server.handle_commands(&get_queue).unwrap();
    (server, device)
}

fn replies(server: &mut Server<NullBackend, MemoryTransport>) -> Vec<Reply> {
    server.tick().unwrap();
    let bytes = server.transport_mut().take_flushed();
    let mut out = Vec::new();
    ChunkedCommandHandler::new()
        .handle_bytes(&bytes, |header, body| {
            out.push(match ReturnWireCmd::decode(header.command_id, body)? {
                ReturnWireCmd::BufferMapAsyncCallback(cmd, data) => Reply::Map(
                    cmd.request_serial,
                    RequestStatus::from_u32(cmd.status)?,
                    data.to_vec(),
                ),
                ReturnWireCmd::QueueWorkDoneCallback(cmd, _) => {
                    Reply::Work(cmd.request_serial, RequestStatus::from_u32(cmd.status)?)
                }
                ReturnWireCmd::ShaderModuleGetCompilationInfoCallback(cmd, info) => Reply::Info(
                    RequestStatus::from_u32(cmd.status)?,
                    decode_compilation_messages(info)?
                        .into_iter()
                        .map(|m| m.kind)
                        .collect(),
                ),
                ReturnWireCmd::DeviceLostCallback(_, message) => {
                    Reply::Lost(String::from_utf8_lossy(message).into_owned())
                }
                other => Reply::Other(other.name()),
            });
            Ok(())
        })
        .unwrap();
    out
}

fn create_buffer(handle: ObjectHandle, usage: BufferUsages, mapped_at_creation: bool) -> Vec<u8> {
    encode_to_vec(
        &DeviceCreateBuffer {
            device: DEVICE,
            result: handle,
            size: 16,
            usage: usage.bits(),
            mapped_at_creation,
        },
        &[],
    )
}

#[test]
fn write_then_map_read_returns_the_bytes() {
    let (mut server, _) = server();
    let buffer = ObjectHandle::new(1, 1);
    let mut stream = create_buffer(buffer, BufferUsages::MAP_READ | BufferUsages::COPY_DST, false);
    let data: Vec<u8> = (0..16).collect();
    stream.extend(encode_to_vec(
        &QueueWriteBuffer {
            queue: QUEUE,
            buffer,
            buffer_offset: 0,
            data_len: 16,
        },
        &data,
    ));
    stream.extend(encode_to_vec(
        &BufferMapAsync {
            buffer,
            request_serial: 1,
            mode: MapMode::READ.bits(),
            offset: 8,
            size: 8,
        },
        &[],
    ));
    server.handle_commands(&stream).unwrap();
    assert_eq!(server.backend().pending(), 1);

    assert_eq!(
        replies(&mut server),
        vec![Reply::Map(1, RequestStatus::Success, data[8..].to_vec())]
    );
    assert!(server.buffer(buffer).unwrap().is_mapped());
}

#[test]
fn mapped_at_creation_data_lands_on_unmap() {
    let (mut server, _) = server();
    let buffer = ObjectHandle::new(1, 1);
    let mut stream = create_buffer(buffer, BufferUsages::COPY_SRC, true);
    stream.extend(encode_to_vec(
        &BufferUpdateMappedData {
            buffer,
            offset: 0,
            data_len: 16,
        },
        &[7; 16],
    ));
    stream.extend(encode_to_vec(&BufferUnmap { buffer }, &[]));
    server.handle_commands(&stream).unwrap();

    let buffer = server.buffer(buffer).unwrap();
    assert!(!buffer.is_mapped());
    assert_eq!(buffer.contents(), vec![7; 16]);
}

#[test]
fn validation_failures_keep_the_connection() {
    let (mut server, _) = server();
    let bad = ObjectHandle::new(1, 1);
    // MAP_READ | MAP_WRITE is rejected by the backend: an error object.
    let mut stream = create_buffer(bad, BufferUsages::MAP_READ | BufferUsages::MAP_WRITE, false);
    stream.extend(encode_to_vec(
        &BufferMapAsync {
            buffer: bad,
            request_serial: 1,
            mode: MapMode::READ.bits(),
            offset: 0,
            size: 16,
        },
        &[],
    ));
    // Unknown map mode bits on a good buffer.
    let good = ObjectHandle::new(2, 1);
    stream.extend(create_buffer(good, BufferUsages::MAP_READ, false));
    stream.extend(encode_to_vec(
        &BufferMapAsync {
            buffer: good,
            request_serial: 1,
            mode: 0x80,
            offset: 0,
            size: 16,
        },
        &[],
    ));
    server.handle_commands(&stream).unwrap();

    assert!(!server.is_disconnected());
    assert!(server.contains(ObjectType::Buffer, bad));
    assert!(server.buffer(bad).is_none());
    assert_eq!(
        replies(&mut server),
        vec![
            Reply::Other("DeviceUncapturedErrorCallback"),
            Reply::Map(1, RequestStatus::Error, Vec::new()),
            Reply::Map(1, RequestStatus::Error, Vec::new()),
        ]
    );
}

#[test]
fn unknown_handles_are_fatal_and_stop_backend_work() {
    let (mut server, _) = server();
    let stream = encode_to_vec(
        &QueueOnSubmittedWorkDone {
            queue: ObjectHandle::new(9, 1),
            request_serial: 1,
        },
        &[],
    );
    assert!(matches!(
        server.handle_commands(&stream),
        Err(WireError::UnknownObject {
            object_type: ObjectType::Queue,
            ..
        })
    ));
    assert!(server.is_disconnected());

    let work = encode_to_vec(
        &QueueOnSubmittedWorkDone {
            queue: QUEUE,
            request_serial: 1,
        },
        &[],
    );
    assert!(matches!(
        server.handle_commands(&work),
        Err(WireError::Disconnected)
    ));
    assert_eq!(server.backend().pending(), 0);
    assert!(matches!(server.tick(), Err(WireError::Disconnected)));
}

#[test]
fn mirroring_onto_a_live_slot_is_fatal() {
    let (mut server, _) = server();
    let stream = encode_to_vec(
        &DeviceGetQueue {
            device: DEVICE,
            result: QUEUE,
        },
        &[],
    );
    assert!(matches!(
        server.handle_commands(&stream),
        Err(WireError::Table { .. })
    ));
    assert!(server.is_disconnected());
}

#[test]
fn completions_for_destroyed_objects_are_dropped() {
    let (mut server, _) = server();
    let stream = [
        encode_to_vec(
            &QueueOnSubmittedWorkDone {
                queue: QUEUE,
                request_serial: 1,
            },
            &[],
        ),
        encode_to_vec(
            &DestroyObject {
                object_type: ObjectType::Queue.to_u32(),
                handle: QUEUE,
            },
            &[],
        ),
    ]
    .concat();
    server.handle_commands(&stream).unwrap();
    assert!(replies(&mut server).is_empty());
    assert_eq!(server.object_count(ObjectType::Queue), 0);
}

#[test]
fn compilation_info_reports_diagnostics() {
    let (mut server, _) = server();
    let module = ObjectHandle::new(1, 1);
    let source = b"fn helper() {}";
    let stream = [
        encode_to_vec(
            &DeviceCreateShaderModule {
                device: DEVICE,
                result: module,
                code_len: source.len() as u64,
            },
            source,
        ),
        encode_to_vec(
            &ShaderModuleGetCompilationInfo {
                shader_module: module,
                request_serial: 1,
            },
            &[],
        ),
    ]
    .concat();
    server.handle_commands(&stream).unwrap();
    assert_eq!(
        replies(&mut server),
        vec![Reply::Info(
            RequestStatus::Success,
            vec![CompilationMessageType::Warning]
        )]
    );
}

#[test]
fn device_loss_is_reported_once() {
    let (mut server, device) = server();
    device.lose("gpu reset");
    device.lose("again");
    let work = encode_to_vec(
        &QueueOnSubmittedWorkDone {
            queue: QUEUE,
            request_serial: 4,
        },
        &[],
    );
    server.handle_commands(&work).unwrap();
    assert_eq!(
        replies(&mut server),
        vec![
            Reply::Lost("gpu reset".into()),
            Reply::Work(4, RequestStatus::Success),
        ]
    );
}

fn map_read(buffer: ObjectHandle, serial: u64) -> Vec<u8> {
    encode_to_vec(
        &BufferMapAsync {
            buffer,
            request_serial: serial,
            mode: MapMode::READ.bits(),
            offset: 0,
            size: 16,
        },
        &[],
    )
}

#[test]
fn buffer_destroy_fails_the_queued_map_and_keeps_the_handle() {
    let (mut server, _) = server();
    let buffer = ObjectHandle::new(1, 1);
    let stream = [
        create_buffer(buffer, BufferUsages::MAP_READ, false),
        map_read(buffer, 1),
        encode_to_vec(&BufferDestroy { buffer }, &[]),
        map_read(buffer, 2),
    ]
    .concat();
    server.handle_commands(&stream).unwrap();
    assert_eq!(
        replies(&mut server),
        vec![
            Reply::Map(1, RequestStatus::DestroyedBeforeCallback, Vec::new()),
            Reply::Map(2, RequestStatus::Error, Vec::new()),
        ]
    );
    assert_eq!(server.object_count(ObjectType::Buffer), 1);
    assert_eq!(server.buffer(buffer).map(|b| b.is_destroyed()), Some(true));
}

#[test]
fn device_destroy_fails_maps_but_answers_other_work() {
    let (mut server, device) = server();
    let buffer = ObjectHandle::new(1, 1);
    let stream = [
        create_buffer(buffer, BufferUsages::MAP_READ, false),
        map_read(buffer, 1),
        encode_to_vec(
            &QueueOnSubmittedWorkDone {
                queue: QUEUE,
                request_serial: 1,
            },
            &[],
        ),
        encode_to_vec(&DeviceDestroy { device: DEVICE }, &[]),
    ]
    .concat();
    server.handle_commands(&stream).unwrap();
    assert!(device.is_lost());
    assert_eq!(
        replies(&mut server),
        vec![
            Reply::Map(1, RequestStatus::DeviceLost, Vec::new()),
            Reply::Work(1, RequestStatus::Success),
        ]
    );
    assert_eq!(server.object_count(ObjectType::Device), 1);
}
