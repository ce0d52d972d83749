//! Integration tests for in-process candidates
//!
//! These run closures through the full isolation path (fork, watchdog,
//! report pipe, classification) without needing a C toolchain.

use fitbox::{EvaluationStatus, Evaluator, HarnessConfig, PopcountMethod, WordWidth};
use std::time::{Duration, Instant};

fn evaluator_with(wall_ms: u64, width: WordWidth) -> Evaluator {
    let config = HarnessConfig {
        wall_time_limit_ms: wall_ms,
        word_width: width,
        ..HarnessConfig::default()
    };
    Evaluator::new(config).unwrap()
}

fn evaluator() -> Evaluator {
    evaluator_with(2000, WordWidth::W32)
}

#[test]
fn test_reference_words_score_their_popcount() {
    let evaluator = evaluator();
    for (word, expected) in [(0x0000_0000u64, 0), (0xFFFF_FFFF, 32), (0b0000_0101, 2)] {
        let result = evaluator.evaluate(move || word).unwrap();
        assert_eq!(result.status, EvaluationStatus::Success);
        assert_eq!(result.fitness.value(), expected, "word {:#x}", word);
        assert_eq!(result.raw_word, Some(word));
        assert_eq!(result.exit_code, Some(0));
    }
}

#[test]
fn test_repeated_evaluation_is_stable() {
    let evaluator = evaluator();
    let first = evaluator.evaluate(|| 0xDEAD_BEEFu64).unwrap();
    let second = evaluator.evaluate(|| 0xDEAD_BEEFu64).unwrap();
    assert_eq!(first.fitness, second.fitness);
    assert_eq!(first.fitness.value(), 24);
    assert_ne!(first.run_id, second.run_id);
}

#[test]
fn test_setting_a_bit_never_lowers_the_score() {
    let evaluator = evaluator();
    let base = 0x0F0F_0000u64;
    let lower = evaluator.evaluate(move || base).unwrap().fitness;
    let higher = evaluator.evaluate(move || base | 0x10).unwrap().fitness;
    assert_eq!(higher.value(), lower.value() + 1);
}

#[test]
fn test_every_popcount_method_agrees_end_to_end() {
    for method in [
        PopcountMethod::ShiftAndTest,
        PopcountMethod::ByteTable,
        PopcountMethod::Hardware,
    ] {
        let evaluator = Evaluator::new(HarnessConfig {
            popcount: method,
            ..HarnessConfig::default()
        })
        .unwrap();
        let result = evaluator.evaluate(|| 0x8000_0001u64).unwrap();
        assert_eq!(result.fitness.value(), 2, "{:?}", method);
    }
}

#[test]
fn test_wide_words_use_all_64_bits() {
    let narrow = evaluator_with(2000, WordWidth::W32).evaluate(|| u64::MAX).unwrap();
    let wide = evaluator_with(2000, WordWidth::W64).evaluate(|| u64::MAX).unwrap();
    assert_eq!(narrow.fitness.value(), 32);
    assert_eq!(wide.fitness.value(), 64);
    assert_eq!(wide.raw_word, Some(u64::MAX));
}

#[test]
fn test_non_terminating_candidate_times_out() {
    let evaluator = evaluator_with(200, WordWidth::W32);
    let started = Instant::now();
    let result = evaluator
        .evaluate(|| -> u64 {
            loop {
                std::hint::spin_loop();
            }
        })
        .unwrap();

    assert_eq!(result.status, EvaluationStatus::Timeout);
    assert_eq!(result.fitness.value(), 0);
    assert!(result.raw_word.is_none());
    assert_eq!(result.signal, Some(libc::SIGKILL));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_sleeping_candidate_times_out() {
    let evaluator = evaluator_with(150, WordWidth::W32);
    let result = evaluator
        .evaluate(|| {
            std::thread::sleep(Duration::from_secs(30));
            1u64
        })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::Timeout);
}

#[test]
fn test_aborting_candidate_is_runtime_fault() {
    let result = evaluator().evaluate(|| -> u64 { std::process::abort() }).unwrap();
    assert_eq!(result.status, EvaluationStatus::RuntimeFault);
    assert_eq!(result.fitness.value(), 0);
    assert_eq!(result.signal, Some(libc::SIGABRT));
    assert!(result.detail.unwrap().contains("SIGABRT"));
}

#[test]
fn test_segfaulting_candidate_is_runtime_fault() {
    let result = evaluator()
        .evaluate(|| -> u64 {
            unsafe {
                libc::raise(libc::SIGSEGV);
            }
            0
        })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::RuntimeFault);
    assert_eq!(result.signal, Some(libc::SIGSEGV));
}

#[test]
fn test_panicking_candidate_is_runtime_fault() {
    let result = evaluator()
        .evaluate(|| -> u64 { panic!("genome decode failed") })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::RuntimeFault);
    assert!(result.detail.unwrap().contains("genome decode failed"));
}

#[test]
fn test_early_exit_is_runtime_fault() {
    let result = evaluator()
        .evaluate(|| -> u64 { unsafe { libc::_exit(0) } })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::RuntimeFault);
    assert_eq!(result.fitness.value(), 0);
}

#[test]
fn test_faulting_candidate_does_not_affect_the_next_one() {
    let evaluator = evaluator();
    let fault = evaluator.evaluate(|| -> u64 { std::process::abort() }).unwrap();
    let ok = evaluator.evaluate(|| 0b111u64).unwrap();
    assert_eq!(fault.status, EvaluationStatus::RuntimeFault);
    assert_eq!(ok.status, EvaluationStatus::Success);
    assert_eq!(ok.fitness.value(), 3);
}

#[test]
fn test_candidate_state_does_not_leak_into_harness() {
    let mut counter = 0u64;
    let result = evaluator()
        .evaluate(|| {
            counter += 1;
            counter
        })
        .unwrap();
    assert_eq!(result.raw_word, Some(1));
    // the increment happened in the child
    assert_eq!(counter, 0);
}

#[test]
fn test_result_serializes_status_in_snake_case() {
    let result = evaluator().evaluate(|| 3u64).unwrap();
    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["status"], "success");
    assert_eq!(value["fitness"], 2);
    assert_eq!(value["entry_point"], "one_max");
}

/// Write `json` straight to the report descriptor and leave without returning.
fn write_report_and_exit(json: &str) -> ! {
    unsafe {
        libc::write(3, json.as_ptr() as *const libc::c_void, json.len());
        libc::_exit(0)
    }
}

fn process_exists(pid: i32) -> bool {
    assert!(pid > 0, "not a pid: {}", pid);
    (unsafe { libc::kill(pid, 0) == 0 })
        || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn evaluator_allowing_fork(wall_ms: u64) -> Evaluator {
    Evaluator::new(HarnessConfig {
        wall_time_limit_ms: wall_ms,
        process_limit: None,
        ..HarnessConfig::default()
    })
    .unwrap()
}

#[test]
fn test_setup_error_written_by_candidate_is_runtime_fault() {
    let result = evaluator()
        .evaluate(|| -> u64 { write_report_and_exit("{\"setup_error\":\"sandbox broke\"}\n") })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::RuntimeFault);
    assert_eq!(result.fitness.value(), 0);
}

#[test]
fn test_link_error_written_by_candidate_is_runtime_fault() {
    let result = evaluator()
        .evaluate(|| -> u64 {
            write_report_and_exit(
                "{\"link_error\":{\"kind\":\"symbol_missing\",\"symbol\":\"one_max\",\"reason\":\"made up\"}}\n",
            )
        })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::RuntimeFault);
    assert!(result.link_error.is_none());
    assert!(result.detail.unwrap().contains("made up"));
}

#[test]
fn test_report_appended_to_a_written_one_is_rejected() {
    let result = evaluator()
        .evaluate(|| -> u64 {
            let junk = b"{\"word\":4294967295}\n";
            unsafe {
                libc::write(3, junk.as_ptr() as *const libc::c_void, junk.len());
            }
            1
        })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::RuntimeFault);
    assert!(result.raw_word.is_none());
}

#[test]
fn test_setup_channels_are_closed_before_the_candidate_runs() {
    let result = evaluator()
        .evaluate(|| -> u64 {
            let byte = b"x";
            [4, 5, 6]
                .iter()
                .filter(|fd| unsafe { libc::write(**fd, byte.as_ptr() as *const libc::c_void, 1) } == -1)
                .count() as u64
        })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::Success);
    assert_eq!(result.raw_word, Some(3));
}

#[test]
fn test_detached_grandchild_does_not_outlive_the_evaluation() {
    let result = evaluator_allowing_fork(2000)
        .evaluate(|| -> u64 {
            match unsafe { libc::fork() } {
                0 => unsafe {
                    libc::setsid();
                    libc::sleep(30);
                    libc::_exit(0)
                },
                pid => pid as u64,
            }
        })
        .unwrap();

    assert_eq!(result.status, EvaluationStatus::Success);
    assert_eq!(result.reaped_descendants, 1);
    let pid = result.raw_word.unwrap() as i32;
    assert!(!process_exists(pid));
}

#[test]
fn test_double_forked_daemon_does_not_outlive_the_evaluation() {
    let result = evaluator_allowing_fork(2000)
        .evaluate(|| -> u64 {
            let mut fds = [0; 2];
            unsafe {
                if libc::pipe(fds.as_mut_ptr()) != 0 {
                    return 0;
                }
                let intermediate = libc::fork();
                if intermediate == 0 {
                    let daemon = libc::fork();
                    if daemon == 0 {
                        libc::setsid();
                        libc::sleep(30);
                        libc::_exit(0);
                    }
                    libc::write(fds[1], &daemon as *const i32 as *const libc::c_void, 4);
                    libc::_exit(0);
                }
                let mut daemon: i32 = 0;
                libc::read(fds[0], &mut daemon as *mut i32 as *mut libc::c_void, 4);
                libc::waitpid(intermediate, std::ptr::null_mut(), 0);
                daemon as u64
            }
        })
        .unwrap();

    assert_eq!(result.status, EvaluationStatus::Success);
    assert!(result.reaped_descendants >= 1);
    let pid = result.raw_word.unwrap() as i32;
    assert!(!process_exists(pid));
}

#[test]
fn test_detached_grandchild_of_a_timed_out_candidate_is_killed() {
    let slot = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            std::mem::size_of::<i32>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(slot, libc::MAP_FAILED);
    let slot = slot as *mut i32;

    let result = evaluator_allowing_fork(300)
        .evaluate(move || -> u64 {
            if unsafe { libc::fork() } == 0 {
                unsafe {
                    libc::setsid();
                    std::ptr::write_volatile(slot, libc::getpid());
                    libc::sleep(30);
                    libc::_exit(0)
                }
            }
            loop {
                std::hint::spin_loop();
            }
        })
        .unwrap();

    let pid = unsafe { std::ptr::read_volatile(slot) };
    unsafe {
        libc::munmap(slot as *mut libc::c_void, std::mem::size_of::<i32>());
    }
    assert_eq!(result.status, EvaluationStatus::Timeout);
    assert_eq!(result.reaped_descendants, 1);
    assert!(!process_exists(pid));
}

#[test]
fn test_candidate_that_kills_its_supervisor_is_runtime_fault() {
    let result = evaluator()
        .evaluate(|| -> u64 {
            unsafe {
                libc::kill(libc::getppid(), libc::SIGKILL);
                libc::sleep(5);
            }
            1
        })
        .unwrap();
    assert_eq!(result.status, EvaluationStatus::RuntimeFault);
    assert!(result.detail.unwrap().contains("supervisor"));
}
