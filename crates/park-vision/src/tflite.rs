use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use image::imageops::FilterType;
use tracing::info;

use crate::detector::{DetectorBackend, MlConfig};
use crate::{decode_output, nms_filter, DetectionBox, Frame, VisionError};

#[repr(C)]
struct TfLiteModel;
#[repr(C)]
struct TfLiteInterpreterOptions;
#[repr(C)]
struct TfLiteInterpreter;
#[repr(C)]
struct TfLiteTensor;
#[repr(C)]
struct TfLiteDelegate;

#[link(name = "tensorflowlite_c")]
extern "C" {
    fn TfLiteModelCreateFromFile(model_path: *const c_char) -> *mut TfLiteModel;
    fn TfLiteModelDelete(model: *mut TfLiteModel);

    fn TfLiteInterpreterOptionsCreate() -> *mut TfLiteInterpreterOptions;
    fn TfLiteInterpreterOptionsDelete(options: *mut TfLiteInterpreterOptions);
    fn TfLiteInterpreterOptionsSetNumThreads(options: *mut TfLiteInterpreterOptions, num_threads: c_int);
    #[cfg_attr(not(feature = "ml-coral"), allow(dead_code))]
    fn TfLiteInterpreterOptionsAddDelegate(options: *mut TfLiteInterpreterOptions, delegate: *mut TfLiteDelegate);

    fn TfLiteInterpreterCreate(model: *const TfLiteModel, options: *const TfLiteInterpreterOptions) -> *mut TfLiteInterpreter;
    fn TfLiteInterpreterDelete(interpreter: *mut TfLiteInterpreter);

    fn TfLiteInterpreterAllocateTensors(interpreter: *mut TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterInvoke(interpreter: *mut TfLiteInterpreter) -> c_int;

    fn TfLiteInterpreterGetInputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *mut TfLiteTensor;
    fn TfLiteInterpreterGetOutputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *const TfLiteTensor;

    fn TfLiteTensorData(tensor: *const TfLiteTensor) -> *mut c_void;
    fn TfLiteTensorByteSize(tensor: *const TfLiteTensor) -> usize;

    fn TfLiteTensorNumDims(tensor: *const TfLiteTensor) -> c_int;
    fn TfLiteTensorDim(tensor: *const TfLiteTensor, dim_index: c_int) -> c_int;
}

#[cfg(feature = "ml-coral")]
#[link(name = "edgetpu")]
extern "C" {
    fn edgetpu_create_delegate(device_type: c_int, device_path: *const c_char, options: *const c_char) -> *mut TfLiteDelegate;
    fn edgetpu_free_delegate(delegate: *mut TfLiteDelegate);
}

fn init_err(msg: impl Into<String>) -> VisionError {
    VisionError::DetectorInit(msg.into())
}

fn infer_err(msg: impl Into<String>) -> VisionError {
    VisionError::Inference(msg.into())
}

pub struct TfliteBackend {
    cfg: MlConfig,
    model: *mut TfLiteModel,
    opts: *mut TfLiteInterpreterOptions,
    interp: *mut TfLiteInterpreter,
    delegate: *mut TfLiteDelegate,
}

// The raw handles are only touched through `&mut self`.
unsafe impl Send for TfliteBackend {}

impl TfliteBackend {
    pub fn new(cfg: MlConfig) -> Result<Self, VisionError> {
        let model_path = if cfg.use_coral { &cfg.model_path_edgetpu } else { &cfg.model_path };
        if !std::path::Path::new(model_path).exists() {
            return Err(init_err(format!("model weights not found: {model_path}")));
        }
        let cpath = CString::new(model_path.as_str()).map_err(|e| init_err(e.to_string()))?;

        #[cfg(not(feature = "ml-coral"))]
        if cfg.use_coral {
            return Err(init_err("ml.use_coral=true but binary not built with --features ml-coral"));
        }

        // Partially built handles are freed by release() through Drop.
        let mut backend = Self {
            model: ptr::null_mut(),
            opts: ptr::null_mut(),
            interp: ptr::null_mut(),
            delegate: ptr::null_mut(),
            cfg: cfg.clone(),
        };

        backend.model = unsafe { TfLiteModelCreateFromFile(cpath.as_ptr()) };
        if backend.model.is_null() {
            return Err(init_err(format!("failed to load tflite model: {model_path}")));
        }

        backend.opts = unsafe { TfLiteInterpreterOptionsCreate() };
        if backend.opts.is_null() {
            return Err(init_err("failed to create tflite options"));
        }
        unsafe { TfLiteInterpreterOptionsSetNumThreads(backend.opts, cfg.threads.max(1) as c_int) };

        #[cfg(feature = "ml-coral")]
        if cfg.use_coral {
            backend.delegate = unsafe { edgetpu_create_delegate(0, ptr::null(), ptr::null()) };
            if backend.delegate.is_null() {
                return Err(init_err("failed to create EdgeTPU delegate"));
            }
            unsafe { TfLiteInterpreterOptionsAddDelegate(backend.opts, backend.delegate) };
        }

        backend.interp = unsafe { TfLiteInterpreterCreate(backend.model, backend.opts) };
        if backend.interp.is_null() {
            return Err(init_err("failed to create tflite interpreter"));
        }
        if unsafe { TfLiteInterpreterAllocateTensors(backend.interp) } != 0 {
            return Err(init_err("TfLiteInterpreterAllocateTensors failed"));
        }

        info!("ml: loaded TFLite model: {}", model_path);
        Ok(backend)
    }

    pub fn inspect(&mut self) -> Result<String, VisionError> {
        if self.interp.is_null() {
            return Err(infer_err("interpreter released"));
        }
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        if input.is_null() {
            return Err(infer_err("no input tensor"));
        }
        let out0 = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, 0) };
        if out0.is_null() {
            return Err(infer_err("no output tensor 0"));
        }

        Ok(format!(
            "TFLite inspect:\n- input[0] dims={:?} bytes={}\n- output[0] dims={:?} bytes={}\n- output_layout={:?}\n",
            tensor_dims(input),
            unsafe { TfLiteTensorByteSize(input) },
            tensor_dims(out0),
            unsafe { TfLiteTensorByteSize(out0) },
            self.cfg.output_layout,
        ))
    }
}

impl DetectorBackend for TfliteBackend {
    fn name(&self) -> &str {
        if self.cfg.use_coral { "tflite+edgetpu" } else { "tflite" }
    }

    fn infer(&mut self, frame: &Frame, min_confidence: f32) -> Result<Vec<DetectionBox>, VisionError> {
        if self.interp.is_null() {
            return Err(infer_err("interpreter released"));
        }
        let resized = image::imageops::resize(frame, self.cfg.img_w, self.cfg.img_h, FilterType::Triangle);

        // assumes u8 RGB input (quant/edgetpu-friendly)
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        if input.is_null() {
            return Err(infer_err("no input tensor"));
        }
        let in_bytes = unsafe { TfLiteTensorByteSize(input) };
        let in_ptr = unsafe { TfLiteTensorData(input) as *mut u8 };
        if in_ptr.is_null() {
            return Err(infer_err("null input tensor data"));
        }
        let need = (self.cfg.img_w * self.cfg.img_h * 3) as usize;
        if in_bytes < need {
            return Err(infer_err(format!("input tensor too small: {in_bytes} < {need}")));
        }
        unsafe { ptr::copy_nonoverlapping(resized.as_raw().as_ptr(), in_ptr, need) };

        if unsafe { TfLiteInterpreterInvoke(self.interp) } != 0 {
            return Err(infer_err("TfLiteInterpreterInvoke failed"));
        }

        let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, 0) };
        if out.is_null() {
            return Err(infer_err("no output tensor 0"));
        }
        let out_dims: Vec<usize> = tensor_dims(out).into_iter().map(|d| d.max(0) as usize).collect();

        let out_ptr = unsafe { TfLiteTensorData(out) as *const f32 };
        if out_ptr.is_null() {
            return Err(infer_err("null output tensor data"));
        }
        let out_len = unsafe { TfLiteTensorByteSize(out) } / std::mem::size_of::<f32>();
        let raw = unsafe { std::slice::from_raw_parts(out_ptr, out_len) };

        let dets = decode_output(
            self.cfg.output_layout,
            &out_dims,
            raw,
            &self.cfg.class_names,
            min_confidence,
            frame.width(),
            frame.height(),
        )?;
        Ok(nms_filter(dets, self.cfg.nms_iou_threshold, self.cfg.max_detections))
    }

    fn release(&mut self) {
        unsafe {
            if !self.interp.is_null() {
                TfLiteInterpreterDelete(self.interp);
            }
            if !self.opts.is_null() {
                TfLiteInterpreterOptionsDelete(self.opts);
            }
            if !self.model.is_null() {
                TfLiteModelDelete(self.model);
            }
        }
        #[cfg(feature = "ml-coral")]
        if !self.delegate.is_null() {
            unsafe { edgetpu_free_delegate(self.delegate) };
        }
        self.interp = ptr::null_mut();
        self.opts = ptr::null_mut();
        self.model = ptr::null_mut();
        self.delegate = ptr::null_mut();
    }
}

fn tensor_dims(t: *const TfLiteTensor) -> Vec<i32> {
    unsafe {
        let nd = TfLiteTensorNumDims(t);
        (0..nd).map(|i| TfLiteTensorDim(t, i)).collect()
    }
}

impl Drop for TfliteBackend {
    fn drop(&mut self) {
        self.release();
    }
}
