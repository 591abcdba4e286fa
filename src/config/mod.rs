pub mod settings;

pub use settings::{
    Config,
    DataType,
    DeviceConfig,
    DirectionLine,
    Framing,
    ModbusSettings,
    NegotiationConfig,
    ParityConfig,
    PointConfig,
    PollingConfig,
    PublishConfig,
    SerialConfig,
    WriteConfig,
};
