//! Integration tests exercising `Context` purely through its public API:
//! importing real encoded notes, calling them against a host-supplied
//! `Inferior`, and observing the resolution cascade across bytecode and
//! native functions.

use std::rc::Rc;

use infinity_notes::prelude::*;

fn uleb(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn chunk(type_id: u64, version: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    uleb(type_id, &mut out);
    uleb(version, &mut out);
    uleb(payload.len() as u64, &mut out);
    out.extend_from_slice(payload);
    out
}

fn archspec(wordsize: u32, swapped: bool) -> u16 {
    let (msb, lsb) = if swapped { (b'8' as u32, b'i' as u32) } else { (b'i' as u32, b'8' as u32) };
    (((msb ^ wordsize) << 8) | (lsb ^ wordsize)) as u16
}

/// Accumulates a NUL-terminated string table, handing back each string's
/// offset as it's added.
#[derive(Default)]
struct Strings {
    bytes: Vec<u8>,
}

impl Strings {
    fn add(&mut self, s: &str) -> u64 {
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        offset
    }

    fn chunk(&self) -> Vec<u8> {
        chunk(4, 1, &self.bytes)
    }
}

/// One `(provider_off, name_off, ptypes_off, rtypes_off)` signature entry.
fn signature_entry(out: &mut Vec<u8>, provider: u64, name: u64, ptypes: u64, rtypes: u64) {
    uleb(provider, out);
    uleb(name, out);
    uleb(ptypes, out);
    uleb(rtypes, out);
}

const LOAD_EXTERNAL_WIDE: u8 = 0x01;
const CALL_WIDE: u8 = 0x00;
const WIDE_ESCAPE: u8 = 0xfa;

/// Builds a note for a function with no parameters or return values whose
/// body is `load_external 1; call` (call the first external, then fall
/// into the synthetic trailing return).
fn calls_first_external(provider: &str, name: &str, external_provider: &str, external_name: &str) -> Vec<u8> {
    let mut strings = Strings::default();
    let own_provider = strings.add(provider);
    let own_name = strings.add(name);
    let empty = strings.add("");
    let ext_provider = strings.add(external_provider);
    let ext_name = strings.add(external_name);

    let mut sig_payload = Vec::new();
    signature_entry(&mut sig_payload, own_provider, own_name, empty, empty);

    let mut ext_payload = Vec::new();
    signature_entry(&mut ext_payload, ext_provider, ext_name, empty, empty);

    let mut code_info = archspec(64, false).to_ne_bytes().to_vec();
    uleb(2, &mut code_info); // max_stack

    let bytecode = vec![WIDE_ESCAPE, LOAD_EXTERNAL_WIDE, 1, WIDE_ESCAPE, CALL_WIDE];

    let mut note = strings.chunk();
    note.extend(chunk(1, 1, &sig_payload));
    note.extend(chunk(3, 1, &ext_payload));
    note.extend(chunk(5, 1, &code_info));
    note.extend(chunk(2, 3, &bytecode));
    note
}

/// `provider::name(i)i` whose body computes `n!` iteratively using only
/// stack shuffles (`dup`/`over`/`swap`) and an `eq`-guarded loop — no
/// locals, matching the corpus's stack-machine style.
fn factorial_iterative_bytecode(provider: &str, name: &str) -> Vec<u8> {
    let mut strings = Strings::default();
    let own_provider = strings.add(provider);
    let own_name = strings.add(name);
    let int_ty = strings.add("i");

    let mut sig_payload = Vec::new();
    signature_entry(&mut sig_payload, own_provider, own_name, int_ty, int_ty);

    let mut code_info = archspec(64, false).to_ne_bytes().to_vec();
    uleb(5, &mut code_info); // max_stack

    let mut bytecode = vec![0x31]; // lit1 -> [n, acc=1]
    bytecode.push(0x14); // over             <- loop head (offset 1) -> [n, acc, n]
    bytecode.push(0x30); // lit0
    bytecode.push(0x29); // eq               (n == 0?)
    bytecode.push(0x28); // bra
    bytecode.extend_from_slice(&8i16.to_le_bytes()); // -> exit, at offset 15
    bytecode.push(0x14); // over             -> [n, acc, n]
    bytecode.push(0x31); // lit1
    bytecode.push(0x1c); // minus            -> [n, acc, n-1]
    bytecode.push(0x17); // rot              -> [n-1, n, acc]
    bytecode.push(0x1e); // mul              -> [n-1, acc*n]
    bytecode.push(0x2f); // skip
    bytecode.extend_from_slice(&(-14i16).to_le_bytes()); // -> loop head
    bytecode.push(0x16); // swap             -> [acc, n=0]
    bytecode.push(0x13); // drop             -> [acc]

    let mut note = strings.chunk();
    note.extend(chunk(1, 1, &sig_payload));
    note.extend(chunk(5, 1, &code_info));
    note.extend(chunk(2, 3, &bytecode));
    note
}

/// `provider::name(i)i` whose body computes `n!` by calling itself
/// (`load_external 0` names this function's own signature, as
/// [`calls_first_external`] does for a real external).
fn factorial_recursive_bytecode(provider: &str, name: &str) -> Vec<u8> {
    let mut strings = Strings::default();
    let own_provider = strings.add(provider);
    let own_name = strings.add(name);
    let int_ty = strings.add("i");

    let mut sig_payload = Vec::new();
    signature_entry(&mut sig_payload, own_provider, own_name, int_ty, int_ty);
    let mut ext_payload = Vec::new();
    signature_entry(&mut ext_payload, own_provider, own_name, int_ty, int_ty);

    let mut code_info = archspec(64, false).to_ne_bytes().to_vec();
    uleb(4, &mut code_info); // max_stack

    let mut bytecode = vec![0x12, 0x31, 0x2c]; // dup ; lit1 ; le   (n <= 1?)
    bytecode.push(0x28); // bra
    bytecode.extend_from_slice(&12i16.to_le_bytes()); // -> base case, at offset 18
    bytecode.push(0x12); // dup              -> [n, n]
    bytecode.push(0x31); // lit1
    bytecode.push(0x1c); // minus            -> [n, n-1]
    bytecode.extend_from_slice(&[WIDE_ESCAPE, LOAD_EXTERNAL_WIDE, 0]); // load_external 0
    bytecode.extend_from_slice(&[WIDE_ESCAPE, CALL_WIDE]); // call     -> [n, f(n-1)]
    bytecode.push(0x1e); // mul              -> [n * f(n-1)]
    bytecode.push(0x2f); // skip
    bytecode.extend_from_slice(&2i16.to_le_bytes()); // -> past the base case
    bytecode.push(0x13); // drop (base case) -> []
    bytecode.push(0x31); // lit1             -> [1]

    let mut note = strings.chunk();
    note.extend(chunk(1, 1, &sig_payload));
    note.extend(chunk(3, 1, &ext_payload));
    note.extend(chunk(5, 1, &code_info));
    note.extend(chunk(2, 3, &bytecode));
    note
}

struct NullInferior;
impl Inferior for NullInferior {
    fn read_memory(&self, _address: u64, _out: &mut [u8]) -> std::result::Result<(), infinity_notes::error::HostStatus> {
        Err(1)
    }
    fn relocate(&self, _reloc: &Reloc) -> std::result::Result<u64, infinity_notes::error::HostStatus> {
        Err(1)
    }
}

/// Scenario 6: register three bytecode functions A -> B -> C (A calls B,
/// B calls C) plus one native C. Exactly one availability callback fires
/// for A, B and C, in that order; unregistering C then fires three more,
/// in the reverse order.
#[test]
fn resolution_cascade_fires_once_per_function_in_dependency_order() {
    let ctx = Context::new(ContextOptions::new());

    let order = Rc::new(std::cell::RefCell::new(Vec::<(String, bool)>::new()));
    let order2 = order.clone();
    ctx.set_availability_observer(move |func, available| {
        order2.borrow_mut().push((func.funcref().name().to_string(), available));
    });

    let a_bytes = calls_first_external("lib", "a", "lib", "b");
    let b_bytes = calls_first_external("lib", "b", "lib", "c");

    let a = ctx.import_bytecode(&a_bytes, None, 0).unwrap();
    assert!(!a.funcref().is_resolved(), "a depends on b, which isn't registered yet");

    let b = ctx.import_bytecode(&b_bytes, None, 0).unwrap();
    assert!(!b.funcref().is_resolved(), "b depends on c, which isn't registered yet");

    let noop: NativeFn = Rc::new(|_xctx, _args, _rets| Ok(()));
    let c = ctx.import_native("lib::c()", noop).unwrap();

    assert!(a.funcref().is_resolved());
    assert!(b.funcref().is_resolved());
    assert!(c.funcref().is_resolved());

    let fired: Vec<(String, bool)> = order.borrow().clone();
    assert_eq!(fired, vec![("a".to_string(), true), ("b".to_string(), true), ("c".to_string(), true)]);

    order.borrow_mut().clear();
    ctx.unregister_func(&c);

    let fired: Vec<(String, bool)> = order.borrow().clone();
    assert_eq!(
        fired,
        vec![("c".to_string(), false), ("b".to_string(), false), ("a".to_string(), false)]
    );
}

/// A bytecode function whose only external is itself (`load_external 0`
/// in the original's numbering) resolves as soon as it's registered, and
/// running it through the public `Context::call` entry point reaches the
/// callee and returns.
#[test]
fn call_runs_a_self_recursive_style_external_through_the_public_api() {
    let ctx = Context::new(ContextOptions::new());
    let inf: Rc<dyn Inferior> = Rc::new(NullInferior);

    let doubled = Rc::new(std::cell::Cell::new(false));
    let doubled2 = doubled.clone();
    let doubler: NativeFn = Rc::new(move |_xctx, _args, _rets| {
        doubled2.set(true);
        Ok(())
    });
    ctx.import_native("lib::callee()", doubler).unwrap();

    let caller_bytes = calls_first_external("lib", "caller", "lib", "callee");
    let caller = ctx.import_bytecode(&caller_bytes, None, 0).unwrap();
    assert!(caller.funcref().is_resolved());

    ctx.call(&caller, &inf, &[]).unwrap();
    assert!(doubled.get());
}

#[test]
fn bad_note_bytes_populate_last_error() {
    let ctx = Context::new(ContextOptions::new());
    let err = ctx.import_bytecode(&[0xff], None, 0).unwrap_err();
    assert!(matches!(err, Error::Corrupt(_) | Error::Unhandled(_) | Error::Invalid(_)));
    assert!(ctx.last_error().is_some());
}

/// Scenario 1: iterative and recursive factorial, called through `Call`
/// with inputs `0..=20` (these all fit a 64-bit word), matching `n!`
/// exactly.
#[test]
fn factorial_via_call_matches_n_factorial_iterative_and_recursive() {
    let ctx = Context::new(ContextOptions::new());
    let inf: Rc<dyn Inferior> = Rc::new(NullInferior);

    let iter_bytes = factorial_iterative_bytecode("lib", "fact_iter");
    let iter = ctx.import_bytecode(&iter_bytes, None, 0).unwrap();
    assert!(iter.funcref().is_resolved());

    let rec_bytes = factorial_recursive_bytecode("lib", "fact_rec");
    let rec = ctx.import_bytecode(&rec_bytes, None, 0).unwrap();
    assert!(rec.funcref().is_resolved());

    let mut expected: i64 = 1;
    for n in 0..=20i64 {
        if n > 0 {
            expected *= n;
        }
        for func in [&iter, &rec] {
            let rets = ctx.call(func, &inf, &[Value::int(n)]).unwrap();
            assert_eq!(rets[0].as_i64(), expected, "{}! via {}", n, func.funcref().signature());
        }
    }
}

/// `STACK_OVERFLOW`'s law (spec §7): the caller's observable `vsp, csp`
/// are restored to their pre-call values when a call fails that way. The
/// one place this redesign can actually get that wrong is a re-entrant
/// call (`Xctx::call`): its `budget_floor` borrows from the *same*
/// `stack_limit` as the outer call it was made from, but runs its own,
/// entirely separate value/call stack. A native function that re-enters
/// into a callee too deep for the remaining budget sees `STACK_OVERFLOW`
/// from that inner call, while the outer bytecode call it's running
/// inside keeps going and finishes normally — the inner failure touches
/// none of the outer call's own stack state.
#[test]
fn stack_overflow_in_a_reentrant_call_leaves_the_caller_to_finish_normally() {
    let ctx = Context::new(ContextOptions {
        stack_limit: 2,
        ..ContextOptions::new()
    });
    let inf: Rc<dyn Inferior> = Rc::new(NullInferior);

    let target_bytes = factorial_recursive_bytecode("lib", "fact_rec");
    let target = ctx.import_bytecode(&target_bytes, None, 0).unwrap();
    assert!(target.funcref().is_resolved());

    let overflowed = Rc::new(std::cell::Cell::new(false));
    let overflowed2 = overflowed.clone();
    let target2 = target.clone();
    let reenter: NativeFn = Rc::new(move |xctx, _args, _rets| {
        let err = xctx.call(&target2, &[Value::int(5)]).unwrap_err();
        overflowed2.set(matches!(err, Error::StackOverflow));
        Ok(())
    });
    ctx.import_native("lib::reenter()", reenter).unwrap();

    let outer_bytes = calls_first_external("lib", "outer", "lib", "reenter");
    let outer = ctx.import_bytecode(&outer_bytes, None, 0).unwrap();
    assert!(outer.funcref().is_resolved());

    let rets = ctx.call(&outer, &inf, &[]).unwrap();
    assert!(rets.is_empty());
    assert!(overflowed.get(), "the re-entrant call should have hit STACK_OVERFLOW");
}
