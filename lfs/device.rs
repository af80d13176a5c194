//! Single-consumer command queue in front of a [`WeightKernel`].
//!
//! The kernel stages of one case share device buffers, so exactly one thread, the device
//! worker, ever touches the kernel. Case workers submit requests through a cloneable
//! [`DeviceHandle`] and block only on their own reply channel; the case optimization that
//! follows runs in parallel again.

use crate::types::WeightBackend;
use crate::weights::{
    HostDeviceKernel, KernelTimings, WeightError, WeightKernel, run_kernel_sequence,
};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use ndarray::{Array2, ArrayView2};
use std::thread::{self, JoinHandle};

enum DeviceCommand {
    LoadFlags {
        flags: Array2<u8>,
        reply: Sender<Result<(), WeightError>>,
    },
    Compute {
        target: usize,
        reply: Sender<Result<DeviceReply, WeightError>>,
    },
    Shutdown,
}

struct DeviceReply {
    weights: Vec<f64>,
    timings: KernelTimings,
}

/// Builds the kernel for a non-CPU weight back end.
pub fn create_kernel(backend: WeightBackend) -> Result<Box<dyn WeightKernel>, WeightError> {
    match backend {
        WeightBackend::Cpu => Err(WeightError::Unavailable(
            "the CPU back end does not use a device kernel".to_string(),
        )),
        WeightBackend::Device => Ok(Box::new(HostDeviceKernel::new())),
        #[cfg(feature = "cuda")]
        WeightBackend::Cuda => Ok(Box::new(crate::cuda_backend::CudaWeightKernel::new()?)),
        #[cfg(not(feature = "cuda"))]
        WeightBackend::Cuda => Err(WeightError::Unavailable(
            "this build was compiled without the `cuda` feature".to_string(),
        )),
    }
}

/// Owner of the device thread. Dropping it shuts the thread down.
pub struct DeviceWorker {
    commands: Sender<DeviceCommand>,
    handle: Option<JoinHandle<(Box<dyn WeightKernel>, KernelTimings)>>,
    kernel_name: &'static str,
}

/// Cloneable submission side of the queue.
#[derive(Clone)]
pub struct DeviceHandle {
    commands: Sender<DeviceCommand>,
}

impl DeviceWorker {
    /// Uploads the case matrix and starts the worker thread.
    pub fn spawn(
        mut kernel: Box<dyn WeightKernel>,
        cases: ArrayView2<'_, f64>,
        classes: &[usize],
    ) -> Result<Self, WeightError> {
        kernel.upload_cases(cases, classes)?;
        let kernel_name = kernel.name();
        let (commands, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("lfs-device".to_string())
            .spawn(move || serve(kernel, rx))
            .map_err(|e| WeightError::Backend(format!("failed to start device worker: {e}")))?;
        log::debug!("Device worker started on the '{kernel_name}' kernel.");
        Ok(Self {
            commands,
            handle: Some(handle),
            kernel_name,
        })
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel_name
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            commands: self.commands.clone(),
        }
    }

    /// Replaces the device copy of the previous iteration's selections.
    pub fn load_flags(&self, f_prior: ArrayView2<'_, u8>) -> Result<(), WeightError> {
        let (reply, rx) = bounded(1);
        self.commands
            .send(DeviceCommand::LoadFlags {
                flags: f_prior.to_owned(),
                reply,
            })
            .map_err(|_| WeightError::Disconnected)?;
        rx.recv().map_err(|_| WeightError::Disconnected)?
    }

    /// Stops the thread and returns the kernel with its accumulated stage timings.
    pub fn shutdown(mut self) -> Result<(Box<dyn WeightKernel>, KernelTimings), WeightError> {
        self.stop()
            .ok_or(WeightError::Disconnected)?
            .map_err(|_| WeightError::Backend("the device worker panicked".to_string()))
    }

    fn stop(&mut self) -> Option<thread::Result<(Box<dyn WeightKernel>, KernelTimings)>> {
        let handle = self.handle.take()?;
        // A closed channel means the worker is already gone; join reports how it ended.
        let _ = self.commands.send(DeviceCommand::Shutdown);
        Some(handle.join())
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        if let Some(Err(_)) = self.stop() {
            log::error!("The device worker panicked.");
        }
    }
}

impl DeviceHandle {
    /// Computes the weights of `target` on the device and copies them into `out`.
    pub fn compute(&self, target: usize, out: &mut [f64]) -> Result<KernelTimings, WeightError> {
        let (reply, rx) = bounded(1);
        self.commands
            .send(DeviceCommand::Compute { target, reply })
            .map_err(|_| WeightError::Disconnected)?;
        let result = rx.recv().map_err(|_| WeightError::Disconnected)??;
        if result.weights.len() != out.len() {
            return Err(WeightError::Shape(format!(
                "device returned {} weights, caller expects {}",
                result.weights.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&result.weights);
        Ok(result.timings)
    }
}

fn serve(
    mut kernel: Box<dyn WeightKernel>,
    rx: Receiver<DeviceCommand>,
) -> (Box<dyn WeightKernel>, KernelTimings) {
    let mut totals = KernelTimings::default();
    let mut n_cases = 0;
    for command in rx {
        match command {
            DeviceCommand::LoadFlags { flags, reply } => {
                n_cases = flags.nrows();
                let _ = reply.send(kernel.upload_flags(flags.view()));
            }
            DeviceCommand::Compute { target, reply } => {
                let mut weights = vec![0.0; n_cases];
                let mut timings = KernelTimings::default();
                let result =
                    run_kernel_sequence(kernel.as_mut(), target, &mut weights, &mut timings)
                        .map(|()| DeviceReply { weights, timings });
                totals.accumulate(&timings);
                let _ = reply.send(result);
            }
            DeviceCommand::Shutdown => break,
        }
    }
    (kernel, totals)
}
