//! JNI exports for `com.wireguard.android.backend.GoBackend`.

use jni::JNIEnv;
use jni::objects::{JClass, JString};
use jni::sys::{jint, jstring};
use tracing::error;

use crate::backend::{VERSION, release_fd};
use crate::ffi::{self, ffi_guard};
use crate::registry::Handle;

fn get_string(env: &mut JNIEnv, s: &JString) -> Option<String> {
    if s.is_null() {
        return None;
    }
    env.get_string(s).ok().map(Into::into)
}

fn new_string(env: &mut JNIEnv, s: &str) -> jstring {
    env.new_string(s)
        .map(|s| s.into_raw())
        .unwrap_or(std::ptr::null_mut())
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_wireguard_android_backend_GoBackend_wgTurnOn<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    ifname: JString<'local>,
    tun_fd: jint,
    settings: JString<'local>,
) -> jint {
    ffi_guard(Handle::INVALID, || {
        let ifname = get_string(&mut env, &ifname);
        let settings = get_string(&mut env, &settings);
        match (ifname, settings) {
            (Some(ifname), Some(settings)) => ffi::turn_on(&ifname, tun_fd, 0, &settings),
            _ => {
                error!("wgTurnOn: missing interface name or settings");
                release_fd(tun_fd);
                Handle::INVALID
            }
        }
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_wireguard_android_backend_GoBackend_wgTurnOff<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jint,
) {
    ffi::wgTurnOff(handle);
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_wireguard_android_backend_GoBackend_wgGetSocketV4<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jint,
) -> jint {
    ffi::wgGetSocketV4(handle)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_wireguard_android_backend_GoBackend_wgGetSocketV6<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jint,
) -> jint {
    ffi::wgGetSocketV6(handle)
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_wireguard_android_backend_GoBackend_wgGetConfig<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    handle: jint,
) -> jstring {
    ffi_guard(std::ptr::null_mut(), || match ffi::config_text(handle) {
        Some(text) => new_string(&mut env, &text),
        None => std::ptr::null_mut(),
    })
}

#[unsafe(no_mangle)]
pub extern "system" fn Java_com_wireguard_android_backend_GoBackend_wgVersion<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jstring {
    ffi_guard(std::ptr::null_mut(), || new_string(&mut env, VERSION))
}
