use ircontrol_shared::{Interface, IrCode, Message};

/// Open the link and send a single code.
pub fn transmit<I: Interface>(
    link: &mut I,
    port: &str,
    baudrate: u32,
    code: &IrCode,
) -> anyhow::Result<()> {
    let msg = Message::ir_send(code)?;

    link.connect(port, baudrate)?;
    log::info!("Sending {}", msg);

    link.put_message(&msg)?;
    log::info!("Sent");

    Ok(())
}
