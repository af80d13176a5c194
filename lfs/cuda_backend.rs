//! [`WeightKernel`] on a CUDA device.
//!
//! Kernels are compiled with NVRTC when the back end is created. Every stage binds the
//! context to the calling thread first, since the kernel is built on the engine thread and
//! then driven from the device worker.

use crate::weights::{WeightError, WeightKernel};
use cudarc::driver::{
    CudaContext, CudaFunction, CudaSlice, CudaStream, DriverError, LaunchConfig, PushKernelArg,
};
use cudarc::nvrtc::compile_ptx;
use ndarray::ArrayView2;
use std::sync::Arc;

const WEIGHT_KERNELS: &str = include_str!("kernels/weights.cu");

struct Kernels {
    difference: CudaFunction,
    distance: CudaFunction,
    class_minimum: CudaFunction,
    term: CudaFunction,
    transpose: CudaFunction,
    sum: CudaFunction,
}

struct Buffers {
    cases: CudaSlice<f64>,
    classes: CudaSlice<i32>,
    flags: Option<CudaSlice<u8>>,
    diff: CudaSlice<f64>,
    dist: CudaSlice<f64>,
    min_same: CudaSlice<f64>,
    min_diff: CudaSlice<f64>,
    terms: CudaSlice<f64>,
    transposed: CudaSlice<f64>,
    sums: CudaSlice<f64>,
}

pub struct CudaWeightKernel {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    kernels: Kernels,
    buffers: Option<Buffers>,
    n_cases: i32,
    n_vars: i32,
}

fn map_driver_err(context: &'static str) -> impl FnOnce(DriverError) -> WeightError {
    move |e| WeightError::Backend(format!("{context}: {e:?}"))
}

fn checked_i32(label: &str, value: usize) -> Result<i32, WeightError> {
    i32::try_from(value).map_err(|_| {
        WeightError::Shape(format!("{label}={value} exceeds i32::MAX required by CUDA"))
    })
}

fn launch_elems(label: &str, value: usize) -> Result<LaunchConfig, WeightError> {
    let n = u32::try_from(value).map_err(|_| {
        WeightError::Shape(format!("{label}={value} exceeds the launch grid limit"))
    })?;
    Ok(LaunchConfig::for_num_elems(n))
}

fn loaded(buffers: &mut Option<Buffers>) -> Result<&mut Buffers, WeightError> {
    buffers
        .as_mut()
        .ok_or_else(|| WeightError::Shape("no cases have been uploaded".to_string()))
}

impl CudaWeightKernel {
    pub fn new() -> Result<Self, WeightError> {
        let ctx = CudaContext::new(0)
            .map_err(|e| WeightError::Unavailable(format!("CUDA init failed: {e:?}")))?;
        let stream = ctx.default_stream();
        let ptx = compile_ptx(WEIGHT_KERNELS)
            .map_err(|e| WeightError::Backend(format!("NVRTC compile failed: {e:?}")))?;
        let module = ctx
            .load_module(ptx)
            .map_err(map_driver_err("Failed to load CUDA module"))?;
        let load = |name: &'static str| {
            module
                .load_function(name)
                .map_err(map_driver_err("Failed to load weight kernel"))
        };
        let kernels = Kernels {
            difference: load("lfs_difference")?,
            distance: load("lfs_distance")?,
            class_minimum: load("lfs_class_minimum")?,
            term: load("lfs_term")?,
            transpose: load("lfs_transpose")?,
            sum: load("lfs_sum")?,
        };
        Ok(Self {
            ctx,
            stream,
            kernels,
            buffers: None,
            n_cases: 0,
            n_vars: 0,
        })
    }

    fn bind(&self) -> Result<(), WeightError> {
        self.ctx
            .bind_to_thread()
            .map_err(map_driver_err("Failed to bind CUDA context"))
    }

    fn square_elems(&self) -> usize {
        let n = self.n_cases as usize;
        n * n
    }
}

impl WeightKernel for CudaWeightKernel {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn upload_cases(
        &mut self,
        cases: ArrayView2<'_, f64>,
        classes: &[usize],
    ) -> Result<(), WeightError> {
        if cases.nrows() != classes.len() {
            return Err(WeightError::Shape(format!(
                "{} case rows but {} class ids",
                cases.nrows(),
                classes.len()
            )));
        }
        self.bind()?;
        self.n_cases = checked_i32("n_cases", cases.nrows())?;
        self.n_vars = checked_i32("n_vars", cases.ncols())?;
        let n = cases.nrows();
        let host_cases: Vec<f64> = cases.iter().copied().collect();
        let host_classes = classes
            .iter()
            .map(|c| checked_i32("class id", *c))
            .collect::<Result<Vec<i32>, _>>()?;
        let stream = &self.stream;
        let alloc = |len: usize| {
            stream
                .alloc_zeros::<f64>(len)
                .map_err(map_driver_err("Failed to allocate weight buffer"))
        };
        self.buffers = Some(Buffers {
            cases: stream
                .memcpy_stod(&host_cases)
                .map_err(map_driver_err("Failed to upload case matrix"))?,
            classes: stream
                .memcpy_stod(&host_classes)
                .map_err(map_driver_err("Failed to upload class ids"))?,
            flags: None,
            diff: alloc(host_cases.len())?,
            dist: alloc(n * n)?,
            min_same: alloc(n)?,
            min_diff: alloc(n)?,
            terms: alloc(n * n)?,
            transposed: alloc(n * n)?,
            sums: alloc(n)?,
        });
        Ok(())
    }

    fn upload_flags(&mut self, f_prior: ArrayView2<'_, u8>) -> Result<(), WeightError> {
        self.bind()?;
        if f_prior.dim() != (self.n_cases as usize, self.n_vars as usize) {
            return Err(WeightError::Shape(format!(
                "flag matrix is {:?}, case matrix is {}x{}",
                f_prior.dim(),
                self.n_cases,
                self.n_vars
            )));
        }
        let host: Vec<u8> = f_prior.iter().copied().collect();
        let b = loaded(&mut self.buffers)?;
        b.flags = Some(
            self.stream
                .memcpy_stod(&host)
                .map_err(map_driver_err("Failed to upload selection flags"))?,
        );
        Ok(())
    }

    fn difference(&mut self, target: usize) -> Result<(), WeightError> {
        self.bind()?;
        let target = checked_i32("target", target)?;
        let cfg = launch_elems("difference elements", (self.n_cases * self.n_vars) as usize)?;
        let b = loaded(&mut self.buffers)?;
        unsafe {
            self.stream
                .launch_builder(&self.kernels.difference)
                .arg(&b.cases)
                .arg(&self.n_cases)
                .arg(&self.n_vars)
                .arg(&target)
                .arg(&mut b.diff)
                .launch(cfg)
                .map_err(map_driver_err("Failed to launch lfs_difference"))?;
        }
        Ok(())
    }

    fn distance(&mut self) -> Result<(), WeightError> {
        self.bind()?;
        let cfg = launch_elems("distance elements", self.square_elems())?;
        let b = loaded(&mut self.buffers)?;
        let flags = b
            .flags
            .as_ref()
            .ok_or_else(|| WeightError::Shape("no selection flags uploaded".to_string()))?;
        unsafe {
            self.stream
                .launch_builder(&self.kernels.distance)
                .arg(&b.diff)
                .arg(flags)
                .arg(&self.n_cases)
                .arg(&self.n_vars)
                .arg(&mut b.dist)
                .launch(cfg)
                .map_err(map_driver_err("Failed to launch lfs_distance"))?;
        }
        Ok(())
    }

    fn class_minimum(&mut self, target: usize) -> Result<(), WeightError> {
        self.bind()?;
        let target = checked_i32("target", target)?;
        let cfg = launch_elems("minimum rows", self.n_cases as usize)?;
        let b = loaded(&mut self.buffers)?;
        unsafe {
            self.stream
                .launch_builder(&self.kernels.class_minimum)
                .arg(&b.dist)
                .arg(&b.classes)
                .arg(&self.n_cases)
                .arg(&target)
                .arg(&mut b.min_same)
                .arg(&mut b.min_diff)
                .launch(cfg)
                .map_err(map_driver_err("Failed to launch lfs_class_minimum"))?;
        }
        Ok(())
    }

    fn term(&mut self, target: usize) -> Result<(), WeightError> {
        self.bind()?;
        let target = checked_i32("target", target)?;
        let cfg = launch_elems("term elements", self.square_elems())?;
        let b = loaded(&mut self.buffers)?;
        unsafe {
            self.stream
                .launch_builder(&self.kernels.term)
                .arg(&b.dist)
                .arg(&b.classes)
                .arg(&b.min_same)
                .arg(&b.min_diff)
                .arg(&self.n_cases)
                .arg(&target)
                .arg(&mut b.terms)
                .launch(cfg)
                .map_err(map_driver_err("Failed to launch lfs_term"))?;
        }
        Ok(())
    }

    fn transpose(&mut self) -> Result<(), WeightError> {
        self.bind()?;
        let cfg = launch_elems("transpose elements", self.square_elems())?;
        let b = loaded(&mut self.buffers)?;
        unsafe {
            self.stream
                .launch_builder(&self.kernels.transpose)
                .arg(&b.terms)
                .arg(&self.n_cases)
                .arg(&mut b.transposed)
                .launch(cfg)
                .map_err(map_driver_err("Failed to launch lfs_transpose"))?;
        }
        Ok(())
    }

    fn sum(&mut self) -> Result<(), WeightError> {
        self.bind()?;
        let cfg = launch_elems("sum rows", self.n_cases as usize)?;
        let b = loaded(&mut self.buffers)?;
        unsafe {
            self.stream
                .launch_builder(&self.kernels.sum)
                .arg(&b.transposed)
                .arg(&self.n_cases)
                .arg(&mut b.sums)
                .launch(cfg)
                .map_err(map_driver_err("Failed to launch lfs_sum"))?;
        }
        Ok(())
    }

    fn read_weights(&mut self, out: &mut [f64]) -> Result<(), WeightError> {
        self.bind()?;
        if out.len() != self.n_cases as usize {
            return Err(WeightError::Shape(format!(
                "readback buffer holds {} weights, device has {}",
                out.len(),
                self.n_cases
            )));
        }
        let b = loaded(&mut self.buffers)?;
        self.stream
            .memcpy_dtoh(&b.sums, out)
            .map_err(map_driver_err("Failed to read weights back"))?;
        self.stream
            .synchronize()
            .map_err(map_driver_err("Failed to synchronize CUDA stream"))
    }
}
