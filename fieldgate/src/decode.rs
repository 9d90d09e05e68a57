/// Controls the decoding of transmitted and received data at the application, frame, and
/// physical layer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DecodeLevel {
    /// Controls decoding of the application-level PDUs
    pub app: AppDecodeLevel,
    /// Controls decoding of the frame envelope
    ///
    /// On TCP, this is the MBAP header. On RTU, this is the unit id and CRC.
    pub frame: FrameDecodeLevel,
    /// Controls the logging of physical layer read/write
    pub physical: PhysDecodeLevel,
}

/// Controls how transmitted and received Protocol Data Units (PDUs) are decoded at the INFO
/// log level
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AppDecodeLevel {
    /// Decode nothing
    Nothing,
    /// Decode the function code only
    FunctionCode,
    /// Decode the function code and the actual data values
    DataValues,
}

/// Controls how the frame envelope is decoded at the INFO log level
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameDecodeLevel {
    /// Decode nothing
    Nothing,
    /// Decode the header
    Header,
    /// Decode the header and the raw payload as hexadecimal
    Payload,
}

/// Controls how data transmitted at the physical layer (TCP, serial, etc) is logged
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhysDecodeLevel {
    /// Log nothing
    Nothing,
    /// Log only the length of data that is sent and received
    Length,
    /// Log the length and the actual data that is sent and received
    Data,
}

impl DecodeLevel {
    /// construct a `DecodeLevel` with nothing enabled
    pub fn nothing() -> Self {
        Self::default()
    }

    /// construct a `DecodeLevel` from its fields
    pub fn new(app: AppDecodeLevel, frame: FrameDecodeLevel, physical: PhysDecodeLevel) -> Self {
        DecodeLevel {
            app,
            frame,
            physical,
        }
    }

    /// return a copy with a different application decode level
    pub fn application(self, app: AppDecodeLevel) -> Self {
        Self { app, ..self }
    }

    /// return a copy with a different frame decode level
    pub fn frame(self, frame: FrameDecodeLevel) -> Self {
        Self { frame, ..self }
    }

    /// return a copy with a different physical layer decode level
    pub fn physical(self, physical: PhysDecodeLevel) -> Self {
        Self { physical, ..self }
    }
}

impl Default for DecodeLevel {
    fn default() -> Self {
        Self {
            app: AppDecodeLevel::Nothing,
            frame: FrameDecodeLevel::Nothing,
            physical: PhysDecodeLevel::Nothing,
        }
    }
}

impl From<AppDecodeLevel> for DecodeLevel {
    fn from(app: AppDecodeLevel) -> Self {
        Self {
            app,
            frame: FrameDecodeLevel::Nothing,
            physical: PhysDecodeLevel::Nothing,
        }
    }
}

impl AppDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        self.function_code()
    }

    pub(crate) fn function_code(&self) -> bool {
        match self {
            AppDecodeLevel::Nothing => false,
            AppDecodeLevel::FunctionCode => true,
            AppDecodeLevel::DataValues => true,
        }
    }

    pub(crate) fn data_values(&self) -> bool {
        match self {
            AppDecodeLevel::Nothing => false,
            AppDecodeLevel::FunctionCode => false,
            AppDecodeLevel::DataValues => true,
        }
    }
}

impl FrameDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        self.header_enabled()
    }

    pub(crate) fn header_enabled(&self) -> bool {
        match self {
            FrameDecodeLevel::Nothing => false,
            FrameDecodeLevel::Header => true,
            FrameDecodeLevel::Payload => true,
        }
    }

    pub(crate) fn payload_enabled(&self) -> bool {
        match self {
            FrameDecodeLevel::Nothing => false,
            FrameDecodeLevel::Header => false,
            FrameDecodeLevel::Payload => true,
        }
    }
}

impl PhysDecodeLevel {
    pub(crate) fn enabled(&self) -> bool {
        self.length_enabled()
    }

    pub(crate) fn length_enabled(&self) -> bool {
        match self {
            PhysDecodeLevel::Nothing => false,
            PhysDecodeLevel::Length => true,
            PhysDecodeLevel::Data => true,
        }
    }

    pub(crate) fn data_enabled(&self) -> bool {
        match self {
            PhysDecodeLevel::Nothing => false,
            PhysDecodeLevel::Length => false,
            PhysDecodeLevel::Data => true,
        }
    }
}
