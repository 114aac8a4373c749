//! HRESULT 检查
//!
//! 每个设备调用都经过 [`check`]，失败时把调用名、HRESULT、系统解码的消息与
//! 源码位置打包成 [`ApiCallError`]。

use windows::core::HRESULT;
use windows::Win32::Foundation::{
    DXGI_ERROR_DEVICE_HUNG, DXGI_ERROR_DEVICE_REMOVED, DXGI_ERROR_DEVICE_RESET, DXGI_ERROR_DRIVER_INTERNAL_ERROR,
    DXGI_ERROR_INVALID_CALL, S_OK,
};

use crate::core::error::{ApiCallError, GraphicsError, PlaygroundError, Result};

/// 检查一次 `windows` 调用的结果
#[track_caller]
pub(crate) fn check<T>(call: &'static str, result: windows::core::Result<T>) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err) => Err(api_error(call, &err)),
    }
}

#[track_caller]
pub(crate) fn api_error(call: &'static str, err: &windows::core::Error) -> PlaygroundError {
    GraphicsError::ApiCall(ApiCallError::new(call, err.code().0, err.message())).into()
}

/// `GetDeviceRemovedReason` 结果的可读描述
pub(crate) fn removed_reason(code: HRESULT) -> String {
    let name = match code {
        S_OK => "device not removed",
        DXGI_ERROR_DEVICE_HUNG => "DXGI_ERROR_DEVICE_HUNG",
        DXGI_ERROR_DEVICE_REMOVED => "DXGI_ERROR_DEVICE_REMOVED",
        DXGI_ERROR_DEVICE_RESET => "DXGI_ERROR_DEVICE_RESET",
        DXGI_ERROR_DRIVER_INTERNAL_ERROR => "DXGI_ERROR_DRIVER_INTERNAL_ERROR",
        DXGI_ERROR_INVALID_CALL => "DXGI_ERROR_INVALID_CALL",
        _ => "unknown reason",
    };
    format!("{} ({:#010x}): {}", name, code.0 as u32, code.message())
}

/// 宽字符串（`SetName`、DXC 参数）
pub(crate) fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_keeps_call_site() {
        let err = windows::core::Error::from(DXGI_ERROR_INVALID_CALL);
        let line = line!() + 1;
        let result: Result<()> = check("CreateCommittedResource", Err(err));
        let location = result.unwrap_err().location().unwrap();
        assert_eq!(location.line(), line);
        assert!(location.file().ends_with("check.rs"));
    }

    #[test]
    fn test_removed_reason_names_code() {
        assert!(removed_reason(DXGI_ERROR_DEVICE_HUNG).starts_with("DXGI_ERROR_DEVICE_HUNG"));
    }
}
