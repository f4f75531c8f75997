/// Raw characteristic value conversions for the CC2650 SensorTag
use crate::{Capability, Measurement, RadioError};

const IR_SCALE_LSB: f64 = 0.03125;

pub(crate) fn cc2650(capability: Capability, data: &[u8]) -> Result<Measurement, RadioError> {
    let expected = match capability {
        Capability::Thermal | Capability::Humidity => 4,
        // 6 bytes from the BMP280 firmware, 4 from older 0.89 firmware
        Capability::Barometric => 4,
        Capability::Luminosity => 2,
    };
    if data.len() < expected {
        return Err(RadioError::Payload {
            capability,
            len: data.len(),
        });
    }

    let m = match capability {
        Capability::Thermal => {
            let object = f64::from(u16_le(data, 0) >> 2) * IR_SCALE_LSB;
            let ambient = f64::from(u16_le(data, 2) >> 2) * IR_SCALE_LSB;
            Measurement::IrTemperature { object, ambient }
        }
        Capability::Humidity => {
            let temperature = -40.0 + (165.0 * f64::from(u16_le(data, 0))) / 65536.0;
            let humidity = f64::from(u16_le(data, 2)) * 100.0 / 65536.0;
            Measurement::Humidity {
                temperature,
                humidity,
            }
        }
        Capability::Barometric if data.len() >= 6 => {
            // 24 bit little endian pressure in the upper half of the value
            let raw = u32::from_le_bytes([data[3], data[4], data[5], 0]);
            Measurement::Pressure {
                pressure: f64::from(raw) / 100.0,
            }
        }
        Capability::Barometric => Measurement::Pressure {
            pressure: sfloat(u16_le(data, 2)),
        },
        Capability::Luminosity => Measurement::Lux {
            lux: sfloat(u16_le(data, 0)),
        },
    };
    Ok(m)
}

/// 12 bit mantissa, 4 bit exponent, in hundredths
fn sfloat(raw: u16) -> f64 {
    let mantissa = f64::from(raw & 0x0FFF);
    let exponent = i32::from((raw & 0xF000) >> 12);
    mantissa * (0.01 * 2f64.powi(exponent))
}

fn u16_le(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}
