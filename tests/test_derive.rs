#![allow(dead_code)]

use hdmem::prelude::*;
use hdmem::DeviceCopy;

#[derive(Clone, DeviceCopy)]
struct ZeroSizedStruct;

#[derive(Clone, DeviceCopy)]
struct TupleStruct(u64, u64);

#[derive(Clone, DeviceCopy)]
struct NormalStruct {
    x: u64,
    y: u64,
}

#[derive(Clone, DeviceCopy)]
struct ContainerStruct {
    a: NormalStruct,
    b: TupleStruct,
}

#[derive(Clone, DeviceCopy)]
struct GenericStruct<T> {
    value: T,
}

#[derive(Clone, DeviceCopy)]
enum TestEnum {
    Unit,
    Tuple(u64),
    Struct { x: u64, y: u64 },
    Container { a: NormalStruct, b: TupleStruct },
}

#[derive(Clone, DeviceCopy)]
enum GenericEnum<T> {
    Unit,
    Generic { val: T },
}

#[derive(Copy, Clone, DeviceCopy)]
#[repr(C)]
union TestUnion {
    u: u64,
    i: i64,
}

#[test]
fn test_hidden_functions() {
    __verify_ZeroSizedStruct_can_implement_DeviceCopy(&ZeroSizedStruct);
    __verify_TupleStruct_can_implement_DeviceCopy(&TupleStruct(0, 0));
    __verify_NormalStruct_can_implement_DeviceCopy(&NormalStruct { x: 0, y: 0 });
    __verify_ContainerStruct_can_implement_DeviceCopy(&ContainerStruct {
        a: NormalStruct { x: 0, y: 0 },
        b: TupleStruct(0, 0),
    });
    __verify_GenericStruct_can_implement_DeviceCopy(&GenericStruct { value: 0u64 });
    __verify_TestEnum_can_implement_DeviceCopy(&TestEnum::Unit);
    __verify_GenericEnum_can_implement_DeviceCopy::<u64>(&GenericEnum::Unit);
    __verify_TestUnion_can_implement_DeviceCopy(&TestUnion { u: 0u64 });
}

#[derive(Clone, Copy, Debug, Default, PartialEq, DeviceCopy)]
#[repr(C)]
struct Particle {
    position: [f32; 3],
    mass: f32,
}

#[test]
fn test_derived_types_round_trip_through_device() {
    let mut ctx = MemoryContext::new(HostBackend::new(), ContextFlags::DEVICE);
    let particles = ctx.allocate::<Particle>(8).unwrap();
    for (i, p) in ctx.host_slice_mut(&particles).unwrap().iter_mut().enumerate() {
        p.position = [i as f32, 0.0, 1.0];
        p.mass = 2.0;
    }

    ctx.synchronize_to_device(&particles, None).unwrap();
    let device = ctx.address_for_current_mode(&particles).unwrap().as_device().unwrap();
    for p in unsafe { ctx.backend_mut().device_slice_mut::<Particle>(device, 8).unwrap() } {
        p.mass *= 2.0;
    }
    ctx.synchronize_to_host(&particles, None).unwrap();

    let host = ctx.host_slice(&particles).unwrap();
    assert_eq!(
        Particle {
            position: [7.0, 0.0, 1.0],
            mass: 4.0
        },
        host[7]
    );
    ctx.release(particles).unwrap();
}
